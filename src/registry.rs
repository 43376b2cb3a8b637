use std::{sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use reqwest::{
    multipart::{Form, Part},
    Client, ClientBuilder, StatusCode,
};
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::{
    metadata::manifest::{self, Manifest, ResourceId, ResourceMetadata},
    protocol::{tracker_messages::SwarmPeer, ParticipantId},
};

static HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
static HTTP_TIMEOUT: Duration = Duration::from_secs(60);
static DEFAULT_DIFFICULTY_LEVEL: &str = "intermediate";

#[derive(Debug, Error)]
#[error("resource {0} not found")]
pub struct ResourceNotFoundError(pub ResourceId);

/// The external catalogue of resources: it assigns resource ids and serves manifests
/// and swarm membership.
#[trait_variant::make(Send)]
pub trait ResourceRegistry: Clone + Sync + 'static {
    async fn create_resource(
        &self,
        manifest: Manifest,
        payload: Arc<Vec<u8>>,
        uploader_id: ParticipantId,
    ) -> Result<ResourceId>;
    async fn fetch_manifest(&self, resource_id: ResourceId) -> Result<Manifest>;
    async fn fetch_swarm_peers(&self, resource_id: ResourceId) -> Result<Vec<SwarmPeer>>;
}

#[derive(Debug, Deserialize)]
struct RegistryResource {
    id: ResourceId,
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    skill_category: String,
    file_hash: String,
    file_size: u64,
    #[serde(default)]
    mime_type: String,
    piece_count: usize,
    piece_size: u64,
    pieces_hash: String,
    #[serde(default)]
    tags: Option<Vec<String>>,
}

impl TryFrom<RegistryResource> for Manifest {
    type Error = anyhow::Error;

    fn try_from(resource: RegistryResource) -> Result<Self> {
        let piece_hashes = manifest::parse_pieces_hash(&resource.pieces_hash)?;
        if piece_hashes.len() != resource.piece_count {
            bail!(
                "resource {} declares {} pieces but lists {} piece digests",
                resource.id,
                resource.piece_count,
                piece_hashes.len()
            );
        }
        let manifest = Manifest {
            content_digest: manifest::parse_digest(&resource.file_hash)?,
            total_size: resource.file_size,
            piece_size: resource.piece_size,
            piece_hashes,
            mime_type: resource.mime_type,
            metadata: ResourceMetadata {
                title: resource.title,
                description: resource.description,
                skill_category: resource.skill_category,
                tags: resource.tags.unwrap_or_default(),
            },
        };
        manifest.validate()?;
        Ok(manifest)
    }
}

/// Registry reached over the platform REST api.
#[derive(Clone)]
pub struct HttpRegistry {
    base_url: Url,
    client: Client,
}

impl HttpRegistry {
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(HttpRegistry {
            base_url: Url::parse(base_url)?,
            client: ClientBuilder::new()
                .connect_timeout(HTTP_CONNECT_TIMEOUT)
                .timeout(HTTP_TIMEOUT)
                .build()?,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path)?)
    }
}

impl ResourceRegistry for HttpRegistry {
    async fn create_resource(
        &self,
        manifest: Manifest,
        payload: Arc<Vec<u8>>,
        uploader_id: ParticipantId,
    ) -> Result<ResourceId> {
        let url = self.endpoint("/api/p2p/resource/create")?;
        log::debug!("registering resource {:?} at {url}", manifest.metadata.title);

        let file = Part::bytes(payload.as_ref().clone())
            .file_name(manifest.metadata.title.clone())
            .mime_str(&manifest.mime_type)?;
        let form = Form::new()
            .text("title", manifest.metadata.title.clone())
            .text("description", manifest.metadata.description.clone())
            .text("skill_category", manifest.metadata.skill_category.clone())
            .text("tags", manifest.metadata.tags.join(","))
            .text("difficulty_level", DEFAULT_DIFFICULTY_LEVEL)
            .text("uploader_id", uploader_id.to_string())
            .part("file", file);

        let resource: RegistryResource = self
            .client
            .post(url)
            .multipart(form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if resource.file_hash != hex::encode(manifest.content_digest) {
            log::warn!(
                "registry computed digest {} for resource {} but we computed {}",
                resource.file_hash,
                resource.id,
                hex::encode(manifest.content_digest)
            );
        }
        Ok(resource.id)
    }

    async fn fetch_manifest(&self, resource_id: ResourceId) -> Result<Manifest> {
        let url = self.endpoint(&format!("/api/p2p/resource/{resource_id}"))?;
        log::debug!("fetching manifest from {url}");
        let response = self.client.get(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            bail!(ResourceNotFoundError(resource_id));
        }
        let resource: RegistryResource = response.error_for_status()?.json().await?;
        // an inconsistent manifest cannot be leeched any more than a missing one
        Manifest::try_from(resource).context(ResourceNotFoundError(resource_id))
    }

    async fn fetch_swarm_peers(&self, resource_id: ResourceId) -> Result<Vec<SwarmPeer>> {
        let url = self.endpoint(&format!("/api/p2p/swarm/{resource_id}/peers"))?;
        log::debug!("fetching swarm peers from {url}");
        let response = self.client.get(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            bail!(ResourceNotFoundError(resource_id));
        }
        // an empty swarm is encoded as null
        let peers: Option<Vec<SwarmPeer>> = response.error_for_status()?.json().await?;
        Ok(peers.unwrap_or_default())
    }
}


#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;
    use crate::{metadata::manifest::DEFAULT_PIECE_SIZE_B, persistence::chunking};

    // Serves a single canned http response and returns the server base url.
    async fn serve_once(status_line: &'static str, body: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let response = format!(
                "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn fetch_manifest_decodes_registry_resource() {
        let payload = vec![3u8; 1024 * 1024 + 10];
        let pieces = chunking::piece_digests(&payload, DEFAULT_PIECE_SIZE_B).unwrap();
        let body = serde_json::json!({
            "id": 12,
            "title": "rust ownership notes",
            "description": "",
            "skill_category": "programming",
            "file_hash": hex::encode(chunking::digest(&payload)),
            "file_size": payload.len(),
            "mime_type": "application/pdf",
            "uploader_id": 1,
            "piece_count": 2,
            "piece_size": DEFAULT_PIECE_SIZE_B,
            "pieces_hash": pieces.iter().map(hex::encode).collect::<Vec<_>>().join(","),
            "tags": null,
            "difficulty_level": "intermediate",
            "rating": 0,
            "download_count": 0,
            "created_at": "2024-01-01T00:00:00Z"
        })
        .to_string();
        let base = serve_once("200 OK", body).await;

        let manifest = HttpRegistry::new(&base)
            .unwrap()
            .fetch_manifest(12)
            .await
            .unwrap();
        assert_eq!(manifest.piece_count(), 2);
        assert_eq!(manifest.piece_hashes, pieces);
        assert_eq!(manifest.metadata.title, "rust ownership notes");
        assert!(manifest.metadata.tags.is_empty());
    }

    #[tokio::test]
    async fn missing_resource_maps_to_not_found() {
        let base = serve_once("404 Not Found", "resource not found".to_string()).await;
        let err = HttpRegistry::new(&base)
            .unwrap()
            .fetch_manifest(99)
            .await
            .unwrap_err();
        assert_matches!(err.downcast_ref::<ResourceNotFoundError>(), Some(ResourceNotFoundError(99)));
    }

    #[test]
    fn inconsistent_resource_is_rejected() {
        let resource = RegistryResource {
            id: 1,
            title: "t".to_string(),
            description: String::new(),
            skill_category: String::new(),
            file_hash: hex::encode(chunking::digest(b"x")),
            file_size: 10,
            mime_type: String::new(),
            piece_count: 3,
            piece_size: 4,
            pieces_hash: hex::encode(chunking::digest(b"x")),
            tags: None,
        };
        assert!(Manifest::try_from(resource).is_err());
    }
}
