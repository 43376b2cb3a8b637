use std::time::Duration;

use size::{Size, Style};
use tokio::{sync::mpsc::Sender, time};

pub fn start_tick(tick_tx: Sender<()>, duration: Duration) {
    tokio::spawn(async move {
        let mut interval = time::interval(duration);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if tick_tx.send(()).await.is_err() {
                log::trace!("tick receiver half closed, stopping ticker");
                return;
            }
        }
    });
}

pub fn pretty_size(bytes: f64) -> String {
    Size::from_bytes(bytes)
        .format()
        .with_style(Style::Abbreviated)
        .to_string()
}
