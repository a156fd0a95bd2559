//! Page metadata: what entity types each page type depends on and how its
//! cache key varies per request.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::entities::EntityType;

/// Cached page types rendered by the site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PageType {
    Home,
    SearchResults,
    CityGuide,
    StayDetails,
    FlightDetails,
    BookingSummary,
}

impl PageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PageType::Home => "Home",
            PageType::SearchResults => "SearchResults",
            PageType::CityGuide => "CityGuide",
            PageType::StayDetails => "StayDetails",
            PageType::FlightDetails => "FlightDetails",
            PageType::BookingSummary => "BookingSummary",
        }
    }
}

impl fmt::Display for PageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a page's cache key differs per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VaryMode {
    /// Key derived from the full canonical URL including every query param.
    FullQueryHash,
    /// Key derived from path, id, and system params only.
    IdAndSystemParams,
    /// Invalidation by advancing a stored timestamp embedded in generated
    /// links; cache entries are never deleted for this mode.
    EntityChangeTimestamp,
}

/// One enumerable query-string combination a page may be cached under.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueryVariant {
    pub params: Vec<(String, String)>,
}

impl QueryVariant {
    pub fn new<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            params: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Per-page-type cache metadata.
#[derive(Debug, Clone)]
pub struct PageMetadata {
    pub page_type: PageType,
    /// URL route segment, empty for the site root.
    pub route: &'static str,
    /// Entity type whose id parameterizes per-instance pages, if any.
    pub identity: Option<EntityType>,
    /// Entity types that affect the page's content without parameterizing it.
    pub associated_with: Vec<EntityType>,
    pub vary: VaryMode,
    /// Enumerable query variants this page is cached under.
    pub query_variants: Vec<QueryVariant>,
}

/// Catalog of page metadata, usually provided by the site configuration.
pub trait PageMetadataCatalog: Send + Sync {
    fn page_types(&self) -> Vec<PageType>;
    fn metadata(&self, page_type: PageType) -> Option<PageMetadata>;
}

/// Static catalog for the travel site's built-in page types.
///
/// Entity detail pages are timestamp-varied: they are invalidated far more
/// often than anything else, and the timestamp mode avoids key-matching
/// scans entirely.
pub struct TravelPageCatalog {
    pages: HashMap<PageType, PageMetadata>,
    order: Vec<PageType>,
}

impl TravelPageCatalog {
    pub fn new() -> Self {
        let entries = vec![
            PageMetadata {
                page_type: PageType::Home,
                route: "",
                identity: None,
                associated_with: vec![EntityType::City, EntityType::Stay, EntityType::Image],
                vary: VaryMode::FullQueryHash,
                query_variants: vec![
                    QueryVariant::default(),
                    QueryVariant::new([("section", "deals")]),
                    QueryVariant::new([("section", "inspiration")]),
                ],
            },
            PageMetadata {
                page_type: PageType::SearchResults,
                route: "search",
                identity: None,
                associated_with: vec![
                    EntityType::City,
                    EntityType::Airport,
                    EntityType::Flight,
                    EntityType::Stay,
                ],
                vary: VaryMode::FullQueryHash,
                query_variants: vec![
                    QueryVariant::new([("sort", "price")]),
                    QueryVariant::new([("sort", "rating")]),
                    QueryVariant::new([("sort", "price"), ("kind", "stay")]),
                    QueryVariant::new([("sort", "price"), ("kind", "flight")]),
                ],
            },
            PageMetadata {
                page_type: PageType::CityGuide,
                route: "cities",
                identity: Some(EntityType::City),
                associated_with: vec![EntityType::Country, EntityType::Airport, EntityType::Image],
                vary: VaryMode::IdAndSystemParams,
                query_variants: vec![
                    QueryVariant::default(),
                    QueryVariant::new([("format", "print")]),
                ],
            },
            PageMetadata {
                page_type: PageType::StayDetails,
                route: "stays",
                identity: Some(EntityType::Stay),
                associated_with: vec![EntityType::City, EntityType::Image],
                vary: VaryMode::EntityChangeTimestamp,
                query_variants: vec![QueryVariant::default()],
            },
            PageMetadata {
                page_type: PageType::FlightDetails,
                route: "flights",
                identity: Some(EntityType::Flight),
                associated_with: vec![EntityType::Airport, EntityType::City],
                vary: VaryMode::EntityChangeTimestamp,
                query_variants: vec![QueryVariant::default()],
            },
            PageMetadata {
                page_type: PageType::BookingSummary,
                route: "bookings",
                identity: Some(EntityType::Booking),
                associated_with: vec![EntityType::Stay, EntityType::Flight],
                vary: VaryMode::IdAndSystemParams,
                query_variants: vec![QueryVariant::default()],
            },
        ];

        let order = entries.iter().map(|m| m.page_type).collect();
        let pages = entries.into_iter().map(|m| (m.page_type, m)).collect();
        Self { pages, order }
    }
}

impl Default for TravelPageCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl PageMetadataCatalog for TravelPageCatalog {
    fn page_types(&self) -> Vec<PageType> {
        self.order.clone()
    }

    fn metadata(&self, page_type: PageType) -> Option<PageMetadata> {
        self.pages.get(&page_type).cloned()
    }
}
