// 📚 Content Catalog - which content is premium, and what it sells as
//
// The Premium Content Mapping ties a displayable content id (a widget design,
// a wallpaper, a clock style) to the product identifier the platform store
// sells. It never records ownership: that lives only in the entitlement cache.
// Content without a mapping is free.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::content::ContentDescriptor;

/// Prefix for generated product identifiers
pub const PRODUCT_ID_PREFIX: &str = "com.app.widget";

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read catalog {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse CSV catalog: {0}")]
    Csv(#[from] csv::Error),

    #[error("failed to parse JSON catalog: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported catalog format: {0:?}")]
    UnsupportedFormat(PathBuf),

    #[error("catalog entry {entry:?} is missing {field}")]
    MissingField { field: &'static str, entry: String },

    #[error("content {content_id:?} has a non-positive price {price}")]
    InvalidPrice { content_id: String, price: Decimal },

    #[error("content {0:?} is registered twice")]
    DuplicateContent(String),

    #[error("content {content_id:?} has an invalid configuration: {problems:?}")]
    InvalidConfig {
        content_id: String,
        problems: Vec<String>,
    },
}

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Widget,
    Wallpaper,
    ClockStyle,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Widget => "widget",
            ContentType::Wallpaper => "wallpaper",
            ContentType::ClockStyle => "clock_style",
        }
    }

    /// Clock styles are sold as widgets
    pub fn purchase_category(&self) -> PurchaseCategory {
        match self {
            ContentType::Widget | ContentType::ClockStyle => PurchaseCategory::Widget,
            ContentType::Wallpaper => PurchaseCategory::Wallpaper,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseCategory {
    Widget,
    Wallpaper,
    Subscription,
}

/// A product offered for sale, as shown in a purchase sheet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchasableItem {
    pub id: Uuid,
    pub product_id: String,
    pub title: String,
    pub description: String,
    pub price: Decimal,
    pub category: PurchaseCategory,
}

impl PurchasableItem {
    pub fn new(
        product_id: &str,
        title: &str,
        description: &str,
        price: Decimal,
        category: PurchaseCategory,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            product_id: product_id.to_string(),
            title: title.to_string(),
            description: description.to_string(),
            price,
            category,
        }
    }
}

/// One row of the Premium Content Mapping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PremiumContent {
    pub content_id: String,
    pub product_id: String,
    pub content_type: ContentType,
    pub price: Decimal,
    #[serde(default)]
    pub title: Option<String>,
}

impl PremiumContent {
    pub fn new(content_id: &str, product_id: &str, content_type: ContentType, price: Decimal) -> Self {
        Self {
            content_id: content_id.to_string(),
            product_id: product_id.to_string(),
            content_type,
            price,
            title: None,
        }
    }

    pub fn with_title(mut self, title: &str) -> Self {
        self.title = Some(title.to_string());
        self
    }

    pub fn validate(&self) -> Result<(), CatalogError> {
        if self.content_id.trim().is_empty() {
            return Err(CatalogError::MissingField {
                field: "content_id",
                entry: self.product_id.clone(),
            });
        }
        if self.product_id.trim().is_empty() {
            return Err(CatalogError::MissingField {
                field: "product_id",
                entry: self.content_id.clone(),
            });
        }
        if self.price <= Decimal::ZERO {
            return Err(CatalogError::InvalidPrice {
                content_id: self.content_id.clone(),
                price: self.price,
            });
        }
        Ok(())
    }

    pub fn to_purchasable_item(&self) -> PurchasableItem {
        let title = self
            .title
            .clone()
            .unwrap_or_else(|| format!("Premium {}", self.content_type.as_str().replace('_', " ")));

        PurchasableItem::new(
            &self.product_id,
            &title,
            "Unlock this premium content to use it.",
            self.price,
            self.content_type.purchase_category(),
        )
    }
}

/// Product id in the `<prefix>.<type>.<uuid>` scheme used for generated content
pub fn product_id_for(content_type: ContentType, id: Uuid) -> String {
    format!("{}.{}.{}", PRODUCT_ID_PREFIX, content_type.as_str(), id)
}

/// On-disk JSON catalog document
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct CatalogDocument {
    #[serde(default)]
    pub premium: Vec<PremiumContent>,
    #[serde(default)]
    pub content: Vec<ContentDescriptor>,
}

// ============================================================================
// CATALOG
// ============================================================================

#[derive(Debug, Default)]
pub struct ContentCatalog {
    premium: HashMap<String, PremiumContent>,
    descriptors: HashMap<String, ContentDescriptor>,
}

impl ContentCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in premium content shipped with the app
    pub fn with_defaults() -> Self {
        let mut catalog = Self::new();

        let defaults = [
            PremiumContent::new(
                "widget_premium_clock_1",
                "com.app.widget.premium_clock_1",
                ContentType::Widget,
                Decimal::from(480),
            ),
            PremiumContent::new(
                "wallpaper_premium_1",
                "com.app.widget.premium_wallpaper_1",
                ContentType::Wallpaper,
                Decimal::from(360),
            ),
        ];

        for content in defaults {
            catalog.premium.insert(content.content_id.clone(), content);
        }

        catalog
    }

    pub fn register(&mut self, content: PremiumContent) -> Result<(), CatalogError> {
        content.validate()?;
        if self.premium.contains_key(&content.content_id) {
            return Err(CatalogError::DuplicateContent(content.content_id));
        }
        self.premium.insert(content.content_id.clone(), content);
        Ok(())
    }

    pub fn register_descriptor(&mut self, descriptor: ContentDescriptor) -> Result<(), CatalogError> {
        descriptor.validate()?;
        if self.descriptors.contains_key(&descriptor.content_id) {
            return Err(CatalogError::DuplicateContent(descriptor.content_id));
        }
        self.descriptors
            .insert(descriptor.content_id.clone(), descriptor);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------------

    /// Load by extension (`.csv` or `.json`)
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("csv") => Self::from_csv_path(path),
            Some("json") => Self::from_json_path(path),
            _ => Err(CatalogError::UnsupportedFormat(path.to_path_buf())),
        }
    }

    /// CSV columns: content_id, product_id, content_type, price, title
    pub fn from_csv_path(path: &Path) -> Result<Self, CatalogError> {
        let mut reader = csv::Reader::from_path(path)?;
        let mut catalog = Self::new();

        for row in reader.deserialize() {
            let mut content: PremiumContent = row?;
            if content.title.as_deref().is_some_and(|t| t.trim().is_empty()) {
                content.title = None;
            }
            catalog.register(content)?;
        }

        info!(path = ?path, premium = catalog.premium.len(), "catalog loaded from CSV");
        Ok(catalog)
    }

    pub fn from_json_path(path: &Path) -> Result<Self, CatalogError> {
        let json = fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let catalog = Self::from_json_str(&json)?;

        info!(
            path = ?path,
            premium = catalog.premium.len(),
            descriptors = catalog.descriptors.len(),
            "catalog loaded from JSON"
        );
        Ok(catalog)
    }

    pub fn from_json_str(json: &str) -> Result<Self, CatalogError> {
        let document: CatalogDocument = serde_json::from_str(json)?;
        let mut catalog = Self::new();

        for content in document.premium {
            catalog.register(content)?;
        }
        for descriptor in document.content {
            catalog.register_descriptor(descriptor)?;
        }

        Ok(catalog)
    }

    // ------------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------------

    pub fn get(&self, content_id: &str) -> Option<&PremiumContent> {
        self.premium.get(content_id)
    }

    pub fn is_premium(&self, content_id: &str) -> bool {
        self.premium.contains_key(content_id)
    }

    pub fn to_purchasable_item(&self, content_id: &str) -> Option<PurchasableItem> {
        self.get(content_id).map(PremiumContent::to_purchasable_item)
    }

    pub fn descriptor(&self, content_id: &str) -> Option<&ContentDescriptor> {
        self.descriptors.get(content_id)
    }

    /// First premium content sold under `product_id`
    pub fn content_for_product(&self, product_id: &str) -> Option<&PremiumContent> {
        self.premium
            .values()
            .find(|content| content.product_id == product_id)
    }

    /// Distinct product ids, sorted
    pub fn product_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .premium
            .values()
            .map(|content| content.product_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Premium content sorted by content id
    pub fn premium_contents(&self) -> Vec<&PremiumContent> {
        let mut contents: Vec<&PremiumContent> = self.premium.values().collect();
        contents.sort_by(|a, b| a.content_id.cmp(&b.content_id));
        contents
    }

    pub fn len(&self) -> usize {
        self.premium.len()
    }

    pub fn is_empty(&self) -> bool {
        self.premium.is_empty()
    }
}
