// 🎨 Content descriptors - typed configuration per content type
//
// Catalog documents carry a configuration block whose shape depends on the
// content type. Each type gets its own variant, and the whole descriptor is
// validated once when the catalog is loaded.

use serde::{Deserialize, Serialize};

use crate::catalog::CatalogError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WidgetStyle {
    Standard,
    Minimal,
    Fancy,
    Calendar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WidgetSize {
    Small,
    Medium,
    Large,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentConfig {
    Widget {
        style: WidgetStyle,
        #[serde(default = "default_widget_size")]
        size: WidgetSize,
        /// Hex colour, `#RRGGBB`
        background_color: String,
        #[serde(default)]
        image_name: Option<String>,
        #[serde(default = "default_font_size")]
        font_size: f64,
        #[serde(default = "default_corner_radius")]
        corner_radius: f64,
        #[serde(default = "default_opacity")]
        opacity: f64,
    },
    Wallpaper {
        image_url: String,
        #[serde(default)]
        lock_screen: bool,
    },
    ClockStyle {
        style: WidgetStyle,
        font_name: String,
        text_color: String,
        #[serde(default)]
        show_seconds: bool,
    },
}

fn default_widget_size() -> WidgetSize {
    WidgetSize::Small
}

fn default_font_size() -> f64 {
    14.0
}

fn default_corner_radius() -> f64 {
    12.0
}

fn default_opacity() -> f64 {
    1.0
}

impl ContentConfig {
    pub fn type_name(&self) -> &'static str {
        match self {
            ContentConfig::Widget { .. } => "widget",
            ContentConfig::Wallpaper { .. } => "wallpaper",
            ContentConfig::ClockStyle { .. } => "clock_style",
        }
    }

    /// Collect every problem with this configuration
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        match self {
            ContentConfig::Widget {
                background_color,
                font_size,
                corner_radius,
                opacity,
                ..
            } => {
                if !is_hex_color(background_color) {
                    problems.push(format!("background_color {:?} is not #RRGGBB", background_color));
                }
                if *font_size <= 0.0 {
                    problems.push("font_size must be positive".to_string());
                }
                if *corner_radius < 0.0 {
                    problems.push("corner_radius must not be negative".to_string());
                }
                if !(0.0..=1.0).contains(opacity) {
                    problems.push("opacity must be within 0.0..=1.0".to_string());
                }
            }
            ContentConfig::Wallpaper { image_url, .. } => {
                if image_url.trim().is_empty() {
                    problems.push("image_url is empty".to_string());
                }
            }
            ContentConfig::ClockStyle {
                font_name,
                text_color,
                ..
            } => {
                if font_name.trim().is_empty() {
                    problems.push("font_name is empty".to_string());
                }
                if !is_hex_color(text_color) {
                    problems.push(format!("text_color {:?} is not #RRGGBB", text_color));
                }
            }
        }

        problems
    }
}

fn is_hex_color(value: &str) -> bool {
    value.len() == 7
        && value.starts_with('#')
        && value[1..].chars().all(|c| c.is_ascii_hexdigit())
}

// ============================================================================
// CONTENT DESCRIPTOR
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentDescriptor {
    pub content_id: String,
    pub name: String,
    pub config: ContentConfig,
}

impl ContentDescriptor {
    pub fn validate(&self) -> Result<(), CatalogError> {
        if self.content_id.trim().is_empty() {
            return Err(CatalogError::MissingField {
                field: "content_id",
                entry: self.name.clone(),
            });
        }

        let problems = self.config.validate();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(CatalogError::InvalidConfig {
                content_id: self.content_id.clone(),
                problems,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagged_config_parses_per_type() {
        let json = r##"[
            {"content_id": "w1", "name": "Clock", "config": {"type": "widget", "style": "minimal", "background_color": "#1A2B3C"}},
            {"content_id": "wp1", "name": "Sky", "config": {"type": "wallpaper", "image_url": "https://cdn.example/sky.png", "lock_screen": true}},
            {"content_id": "c1", "name": "Retro", "config": {"type": "clock_style", "style": "fancy", "font_name": "Menlo", "text_color": "#FFFFFF"}}
        ]"##;

        let descriptors: Vec<ContentDescriptor> = serde_json::from_str(json).unwrap();
        assert_eq!(descriptors.len(), 3);

        match &descriptors[0].config {
            ContentConfig::Widget {
                size, font_size, ..
            } => {
                assert_eq!(*size, WidgetSize::Small);
                assert_eq!(*font_size, 14.0);
            }
            other => panic!("expected widget config, got {:?}", other),
        }
        assert_eq!(descriptors[1].config.type_name(), "wallpaper");
        assert_eq!(descriptors[2].config.type_name(), "clock_style");

        for d in &descriptors {
            assert!(d.validate().is_ok(), "{} should validate", d.content_id);
        }
    }

    #[test]
    fn test_unknown_type_is_rejected_at_parse() {
        let json = r#"{"type": "icon_pack", "pack": "x"}"#;
        assert!(serde_json::from_str::<ContentConfig>(json).is_err());
    }

    #[test]
    fn test_validation_collects_all_problems() {
        let descriptor = ContentDescriptor {
            content_id: "w1".to_string(),
            name: "Broken".to_string(),
            config: ContentConfig::Widget {
                style: WidgetStyle::Standard,
                size: WidgetSize::Medium,
                background_color: "red".to_string(),
                image_name: None,
                font_size: 0.0,
                corner_radius: -1.0,
                opacity: 1.5,
            },
        };

        match descriptor.validate() {
            Err(CatalogError::InvalidConfig { problems, .. }) => assert_eq!(problems.len(), 4),
            other => panic!("expected invalid config, got {:?}", other),
        }
    }
}
