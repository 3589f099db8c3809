//! Provider feed files as handed over by the fetch side.

use std::path::Path;

use anyhow::{Context, Result};
use catsync_core::ProviderItem;
use serde::Deserialize;

/// A parsed feed plus the bytes it was parsed from, for fingerprinting.
#[derive(Debug, Clone)]
pub struct FeedFile {
    pub raw: Vec<u8>,
    pub items: Vec<ProviderItem>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FeedDocument {
    Items(Vec<ProviderItem>),
    Wrapped { items: Vec<ProviderItem> },
}

impl FeedFile {
    /// Accepts a bare JSON array of items or an object with an `items` array.
    pub fn parse(raw: Vec<u8>) -> Result<Self> {
        let items = match serde_json::from_slice::<FeedDocument>(&raw)
            .context("feed must be a JSON array of items or an object with an `items` array")?
        {
            FeedDocument::Items(items) | FeedDocument::Wrapped { items } => items,
        };
        Ok(Self { raw, items })
    }
}

pub async fn load_feed_file(path: &Path) -> Result<FeedFile> {
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    FeedFile::parse(raw).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_bare_and_wrapped_feeds() {
        let bare = br#"[{"natural_key":"000381201669","name":"Claw Hammer","brand":"Stanley"}]"#;
        let feed = FeedFile::parse(bare.to_vec()).expect("bare");
        assert_eq!(feed.items.len(), 1);
        assert_eq!(feed.items[0].fields.brand.as_deref(), Some("Stanley"));

        let wrapped = br#"{"items":[{"natural_key":"1","name":"a"},{"natural_key":"2","name":"b"}]}"#;
        let feed = FeedFile::parse(wrapped.to_vec()).expect("wrapped");
        assert_eq!(feed.items.len(), 2);
        assert_eq!(feed.raw, wrapped.to_vec());
    }

    #[test]
    fn rejects_other_shapes() {
        assert!(FeedFile::parse(br#"{"records":[]}"#.to_vec()).is_err());
        assert!(FeedFile::parse(b"not json".to_vec()).is_err());
    }

    #[tokio::test]
    async fn loads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(file, r#"[{{"natural_key":"42","name":"Answer","vendor_sku":"SKU-42","price_minor":4200}}]"#)
            .expect("write");
        let feed = load_feed_file(file.path()).await.expect("load");
        assert_eq!(feed.items[0].price_minor, Some(4200));
        assert!(feed.items[0].carries_vendor_data());
    }
}
