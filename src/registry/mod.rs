use crate::cache::TagCache;
use crate::config::DockerRegistry;
use crate::metrics::{REGISTRY_ERRORS, REGISTRY_TAGS_INDEXED};
use crate::models::TagInfo;
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference};
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Feeds the tag cache from a container registry
#[async_trait]
pub trait TagSource: Send + Sync {
    /// Index every tag of `images` into `cache`, returning how many were written
    async fn scan(
        &self,
        registry: &DockerRegistry,
        images: &[String],
        cache: &TagCache,
    ) -> Result<usize>;
}

/// [`TagSource`] speaking the OCI distribution API.
///
/// Push times come from the `created` field of each image config. They are
/// memoized by manifest digest, so re-scanning an unchanged tag costs a single
/// digest request.
#[derive(Default)]
pub struct OciScanner {
    created: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl OciScanner {
    pub fn new() -> Self {
        Self::default()
    }

    async fn scan_image(
        &self,
        client: &Client,
        auth: &RegistryAuth,
        image: &str,
    ) -> Result<Vec<TagInfo>> {
        let reference = Reference::try_from(image)
            .with_context(|| format!("Invalid image reference {}", image))?;

        let tag_response = client
            .list_tags(&reference, auth, None, None)
            .await
            .with_context(|| format!("Failed to list tags of {}", image))?;
        debug!("Found {} tags for {}", tag_response.tags.len(), image);

        let mut found = Vec::with_capacity(tag_response.tags.len());
        for tag in tag_response.tags {
            let tag_ref = Reference::with_tag(
                reference.registry().to_string(),
                reference.repository().to_string(),
                tag.clone(),
            );

            let digest = match client.fetch_manifest_digest(&tag_ref, auth).await {
                Ok(digest) => digest,
                Err(e) => {
                    debug!("Failed to resolve {}:{}: {}", image, tag, e);
                    continue;
                },
            };
            let created = self.created_at(client, auth, &tag_ref, &digest).await;

            found.push(TagInfo {
                image: image.to_string(),
                hash: strip_algorithm(&digest).to_string(),
                created,
                tag,
            });
        }

        Ok(found)
    }

    async fn created_at(
        &self,
        client: &Client,
        auth: &RegistryAuth,
        reference: &Reference,
        digest: &str,
    ) -> DateTime<Utc> {
        if let Some(created) = self.created.read().await.get(digest) {
            return *created;
        }

        let created = match client.pull_manifest_and_config(reference, auth).await {
            Ok((_, _, config)) => parse_created(&config),
            Err(e) => {
                debug!("Failed to fetch config of {}: {}", reference, e);
                None
            },
        };

        // Images without a creation time count as pushed when first seen
        let created = created.unwrap_or_else(Utc::now);
        self.created
            .write()
            .await
            .insert(digest.to_string(), created);
        created
    }
}

#[async_trait]
impl TagSource for OciScanner {
    async fn scan(
        &self,
        registry: &DockerRegistry,
        images: &[String],
        cache: &TagCache,
    ) -> Result<usize> {
        let start = Instant::now();
        let client = Client::new(client_config(registry));
        let auth = registry_auth(registry);

        let scan = async {
            let mut total = 0;
            for image in images {
                match self.scan_image(&client, &auth, image).await {
                    Ok(found) => {
                        cache.put_many(&found)?;
                        total += found.len();
                    },
                    Err(e) => {
                        warn!("{:#}", e);
                        REGISTRY_ERRORS.inc();
                    },
                }
            }
            Ok::<_, anyhow::Error>(total)
        };

        let total = tokio::time::timeout(registry.timeout(), scan)
            .await
            .map_err(|_| {
                anyhow!(
                    "Scan of {} timed out after {}s",
                    registry.reg,
                    registry.time_out
                )
            })??;

        REGISTRY_TAGS_INDEXED.inc_by(total as u64);
        info!(
            "Registry scan of {} complete: {} images, {} tags in {:?}",
            registry.reg,
            images.len(),
            total,
            start.elapsed()
        );
        Ok(total)
    }
}

fn client_config(registry: &DockerRegistry) -> ClientConfig {
    let protocol = if registry.insecure {
        let host = registry.reg.split('/').next().unwrap_or_default();
        ClientProtocol::HttpsExcept(vec![host.to_string()])
    } else {
        ClientProtocol::Https
    };

    ClientConfig {
        protocol,
        ..Default::default()
    }
}

fn registry_auth(registry: &DockerRegistry) -> RegistryAuth {
    match (&registry.username, &registry.password) {
        (Some(user), Some(pass)) => {
            debug!("Using basic authentication for {}", registry.reg);
            RegistryAuth::Basic(user.clone(), pass.clone())
        },
        _ => RegistryAuth::Anonymous,
    }
}

/// `sha256:abc` becomes `abc`
fn strip_algorithm(digest: &str) -> &str {
    digest.split_once(':').map_or(digest, |(_, hex)| hex)
}

/// Read the `created` timestamp of an image config
fn parse_created(config: &str) -> Option<DateTime<Utc>> {
    let value: serde_json::Value = serde_json::from_str(config).ok()?;
    let created = value.get("created")?.as_str()?;
    DateTime::parse_from_rfc3339(created)
        .map(|created| created.with_timezone(&Utc))
        .ok()
}
