//! Simplestreams catalog probing
//!
//! When a machine carries no explicit image source, the operator derives a
//! `kubeadm/{version}` alias and verifies it exists on the catalog before
//! accepting it. An absent alias is terminal: provisioning would never
//! succeed no matter how often it is retried.

use serde::Deserialize;

use crate::crd::InstanceKind;
use crate::error::{Error, Result};

#[derive(Debug, Default, Deserialize)]
struct ProductCatalog {
    #[serde(default)]
    products: std::collections::BTreeMap<String, Product>,
}

#[derive(Debug, Default, Deserialize)]
struct Product {
    /// Comma-separated alias list, e.g. "kubeadm/v1.31.0,kubeadm/1.31.0"
    #[serde(default)]
    aliases: String,
    #[serde(default)]
    versions: std::collections::BTreeMap<String, ProductVersion>,
}

#[derive(Debug, Default, Deserialize)]
struct ProductVersion {
    #[serde(default)]
    items: std::collections::BTreeMap<String, ProductItem>,
}

#[derive(Debug, Default, Deserialize)]
struct ProductItem {
    #[serde(default)]
    ftype: String,
}

impl Product {
    fn has_alias(&self, alias: &str) -> bool {
        self.aliases.split(',').any(|a| a.trim() == alias)
    }

    /// Virtual machines need a disk image; containers a root filesystem.
    fn supports(&self, kind: InstanceKind) -> bool {
        let wanted: &[&str] = match kind {
            InstanceKind::VirtualMachine => &["disk-kvm.img", "disk1.img"],
            InstanceKind::Container => &["squashfs", "root.tar.xz", "lxd.tar.xz"],
        };
        self.versions.values().any(|version| {
            version
                .items
                .values()
                .any(|item| wanted.contains(&item.ftype.as_str()))
        })
    }
}

/// Check that the catalog at `server` provides `alias` for the given
/// instance kind.
pub async fn has_image_alias(
    http: &reqwest::Client,
    server: &str,
    alias: &str,
    kind: InstanceKind,
) -> Result<bool> {
    let url = format!("{}/streams/v1/images.json", server.trim_end_matches('/'));
    let response = http.get(&url).send().await?;
    if !response.status().is_success() {
        return Err(Error::IncusApi {
            operation: "GetImageCatalog".to_string(),
            message: format!("{url}: HTTP {}", response.status()),
        });
    }

    let catalog: ProductCatalog = response.json().await?;
    Ok(catalog
        .products
        .values()
        .any(|product| product.has_alias(alias) && product.supports(kind)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog(json: &str) -> ProductCatalog {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_alias_matching() {
        let catalog = catalog(
            r#"{"products": {"kubeadm:v1.31.0:amd64": {
                "aliases": "kubeadm/v1.31.0,kubeadm/1.31.0",
                "versions": {"20250101": {"items": {
                    "root.squashfs": {"ftype": "squashfs"},
                    "disk-kvm.img": {"ftype": "disk-kvm.img"}
                }}}
            }}}"#,
        );

        let product = catalog.products.values().next().unwrap();
        assert!(product.has_alias("kubeadm/v1.31.0"));
        assert!(product.has_alias("kubeadm/1.31.0"));
        assert!(!product.has_alias("kubeadm/v1.30.0"));
        assert!(product.supports(InstanceKind::Container));
        assert!(product.supports(InstanceKind::VirtualMachine));
    }

    #[test]
    fn test_container_only_product() {
        let catalog = catalog(
            r#"{"products": {"kubeadm:v1.31.0:amd64": {
                "aliases": "kubeadm/v1.31.0",
                "versions": {"20250101": {"items": {
                    "root.squashfs": {"ftype": "squashfs"}
                }}}
            }}}"#,
        );

        let product = catalog.products.values().next().unwrap();
        assert!(product.supports(InstanceKind::Container));
        assert!(!product.supports(InstanceKind::VirtualMachine));
    }
}
