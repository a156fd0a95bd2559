//! Cache-key derivation.
//!
//! Stored keys follow `page:{page_type}:{page_id or "-"}:{fragment}` where
//! the fragment is derived from the canonical URL per the page's vary mode.
//! The renderer stores under [`page_key`]; the cleaner removes by matching
//! computed fragments or prefixes against the store's key listing.

use sha2::{Digest, Sha256};

use crate::domain::pages::{PageMetadata, PageType, QueryVariant, VaryMode};

/// Query params that survive key derivation under `IdAndSystemParams`.
const SYSTEM_PARAMS: &[&str] = &["format", "preview"];

/// Prefix shared by every stored key of a page type.
pub fn type_prefix(page_type: PageType) -> String {
    format!("page:{page_type}:")
}

/// Prefix shared by every stored key of one page instance.
pub fn instance_prefix(page_type: PageType, page_id: Option<&str>) -> String {
    format!("page:{page_type}:{}:", page_id.unwrap_or("-"))
}

/// Canonical URL a page variant is keyed on: locale-prefixed path plus the
/// sorted, form-encoded query.
pub fn canonical_url(
    meta: &PageMetadata,
    page_id: Option<&str>,
    locale: &str,
    variant: &QueryVariant,
) -> String {
    let mut path = format!("/{locale}");
    if !meta.route.is_empty() {
        path.push('/');
        path.push_str(meta.route);
    }
    if let Some(id) = page_id {
        path.push('/');
        path.push_str(id);
    }
    let mut pairs = variant.params.clone();
    pairs.sort();
    if pairs.is_empty() {
        return path;
    }
    let query = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .finish();
    format!("{path}?{query}")
}

fn hash_fragment(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(&digest[..8])
}

/// Key fragment for one page variant under the page's vary mode.
///
/// Timestamp-varied pages derive no fragment: their invalidation advances a
/// stored version instead of deleting keys.
pub fn vary_fragment(
    meta: &PageMetadata,
    page_id: Option<&str>,
    locale: &str,
    variant: &QueryVariant,
) -> Option<String> {
    match meta.vary {
        VaryMode::EntityChangeTimestamp => None,
        VaryMode::FullQueryHash => Some(hash_fragment(&canonical_url(
            meta, page_id, locale, variant,
        ))),
        VaryMode::IdAndSystemParams => {
            let system = QueryVariant {
                params: variant
                    .params
                    .iter()
                    .filter(|(name, _)| SYSTEM_PARAMS.contains(&name.as_str()))
                    .cloned()
                    .collect(),
            };
            Some(hash_fragment(&canonical_url(meta, page_id, locale, &system)))
        }
    }
}

/// Full stored key for one cached page variant, as written by the renderer.
pub fn page_key(
    meta: &PageMetadata,
    page_id: Option<&str>,
    locale: &str,
    variant: &QueryVariant,
) -> String {
    let fragment = vary_fragment(meta, page_id, locale, variant)
        .unwrap_or_else(|| hash_fragment(&canonical_url(meta, page_id, locale, variant)));
    format!("{}{fragment}", instance_prefix(meta.page_type, page_id))
}

/// Every key a page instance may currently be stored under:
/// `{supported locales} × {enumerable query variants}`.
pub fn all_page_keys(meta: &PageMetadata, page_id: Option<&str>, locales: &[String]) -> Vec<String> {
    let default_variants = [QueryVariant::default()];
    let variants: &[QueryVariant] = if meta.query_variants.is_empty() {
        &default_variants
    } else {
        &meta.query_variants
    };

    let mut keys = Vec::new();
    for locale in locales {
        for variant in variants {
            keys.push(page_key(meta, page_id, locale, variant));
        }
    }
    keys.sort();
    keys.dedup();
    keys
}
