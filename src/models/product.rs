use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Opaque reference to a CMS-managed asset. Only the id crosses the boundary;
/// turning it into a URL is the job of an [`AssetResolver`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetRef(pub String);

/// Capability for turning an asset reference into a fetchable URL.
pub trait AssetResolver: Send + Sync {
    fn resolve(&self, asset: &AssetRef) -> String;
}

/// Resolves assets against a fixed base URL (CDN or CMS file endpoint).
#[derive(Debug, Clone)]
pub struct BaseUrlResolver {
    base_url: String,
}

impl BaseUrlResolver {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

impl AssetResolver for BaseUrlResolver {
    fn resolve(&self, asset: &AssetRef) -> String {
        format!("{}/{}", self.base_url, urlencoding::encode(&asset.0))
    }
}

/// Read-only mirror of a CMS product.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub title: String,
    pub price: Decimal,
    #[serde(default)]
    pub items: Vec<String>,
    pub category: String,
    #[serde(default)]
    pub file: Option<AssetRef>,
    /// Overrides the configured default download quota
    #[serde(default)]
    pub max_downloads: Option<i32>,
}
