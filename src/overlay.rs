//! Identity card drawn over the composited scene.
//!
//! The metadata record arrives as JSON. Only the fields allowed by its
//! privacy level become lines on the card; everything missing is simply
//! left out.

use crate::config::parse_hex_color;
use anyhow::{Context, Result};
use image::{Rgba, RgbaImage};
use serde::Deserialize;
use std::path::Path;

const DEFAULT_PRIMARY: [u8; 3] = [0x00, 0x52, 0xCC];
const DEFAULT_SECONDARY: [u8; 3] = [0x00, 0xB8, 0xD9];

const MARGIN: u32 = 12;
const PADDING: u32 = 12;
const GAP: u32 = 10;
const LINE_GAP: u32 = 4;
const MAX_WIDTH: u32 = 420;
const ACCENT_HEIGHT: u32 = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivacyLevel {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Contact {
    pub email: Option<String>,
    pub telegram: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CorporateColors {
    pub primary: Option<String>,
    pub secondary: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Branding {
    pub logo_url: Option<String>,
    pub corporate_colors: Option<CorporateColors>,
    pub slogan: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct OverlayMetadata {
    pub full_name: Option<String>,
    pub position: Option<String>,
    pub company: Option<String>,
    pub department: Option<String>,
    pub office_location: Option<String>,
    pub contact: Option<Contact>,
    pub branding: Option<Branding>,
    pub privacy_level: Option<PrivacyLevel>,
}

impl OverlayMetadata {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Invalid overlay metadata")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read overlay file {}", path.display()))?;
        Self::from_json(&json)
    }

    pub fn privacy(&self) -> PrivacyLevel {
        self.privacy_level.unwrap_or_default()
    }

    /// Lines the privacy level permits, in card order.
    pub fn visible_lines(&self) -> Vec<(Field, &str)> {
        let level = self.privacy();
        let contact = self.contact.as_ref();
        let candidates = [
            (Field::Name, self.full_name.as_deref()),
            (Field::Position, self.position.as_deref()),
            (Field::Company, self.company.as_deref()),
            (Field::Department, self.department.as_deref()),
            (Field::Location, self.office_location.as_deref()),
            (Field::Email, contact.and_then(|c| c.email.as_deref())),
            (Field::Telegram, contact.and_then(|c| c.telegram.as_deref())),
        ];

        candidates
            .into_iter()
            .filter(|(field, _)| field.min_level() <= level)
            .filter_map(|(field, text)| match text {
                Some(t) if !t.trim().is_empty() => Some((field, t)),
                _ => None,
            })
            .collect()
    }

    pub fn accent_colors(&self) -> ([u8; 3], [u8; 3]) {
        let colors = self
            .branding
            .as_ref()
            .and_then(|b| b.corporate_colors.as_ref());
        let primary = colors
            .and_then(|c| c.primary.as_deref())
            .and_then(parse_hex_color)
            .unwrap_or(DEFAULT_PRIMARY);
        let secondary = colors
            .and_then(|c| c.secondary.as_deref())
            .and_then(parse_hex_color)
            .unwrap_or(DEFAULT_SECONDARY);
        (primary, secondary)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Name,
    Position,
    Company,
    Department,
    Location,
    Email,
    Telegram,
}

impl Field {
    fn min_level(self) -> PrivacyLevel {
        match self {
            Field::Name | Field::Position => PrivacyLevel::Low,
            Field::Company | Field::Department | Field::Location => PrivacyLevel::Medium,
            Field::Email | Field::Telegram => PrivacyLevel::High,
        }
    }

    pub fn label(self) -> Option<&'static str> {
        match self {
            Field::Name | Field::Position => None,
            Field::Company => Some("Company"),
            Field::Department => Some("Department"),
            Field::Location => Some("Location"),
            Field::Email => Some("Email"),
            Field::Telegram => Some("Telegram"),
        }
    }

    fn line_height(self) -> u32 {
        match self {
            Field::Name => 20,
            Field::Position => 16,
            _ => 15,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x && x < self.x + self.width && y >= self.y && y < self.y + self.height
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LineSlot {
    pub field: Field,
    pub text: String,
    pub rect: Rect,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CardLayout {
    pub card: Rect,
    pub accent: Rect,
    pub lines: Vec<LineSlot>,
    pub primary: [u8; 3],
    pub secondary: [u8; 3],
}

/// Place the card in the top-right corner of a `width` x `height` frame.
pub fn layout(meta: &OverlayMetadata, width: u32, height: u32) -> Option<CardLayout> {
    let card_width = MAX_WIDTH.min(width.checked_sub(2 * MARGIN)?);
    let inner_width = card_width.checked_sub(2 * PADDING)?;
    if inner_width == 0 {
        return None;
    }

    let x = width - MARGIN - card_width;
    let inner_x = x + PADDING;
    let mut y = MARGIN + PADDING;

    let accent = Rect {
        x: inner_x,
        y,
        width: inner_width,
        height: ACCENT_HEIGHT,
    };
    y += ACCENT_HEIGHT + GAP;

    let mut lines = Vec::new();
    for (field, text) in meta.visible_lines() {
        let line_height = field.line_height();
        lines.push(LineSlot {
            field,
            text: match field.label() {
                Some(label) => format!("{}: {}", label, text),
                None => text.to_string(),
            },
            rect: Rect {
                x: inner_x,
                y,
                width: inner_width,
                height: line_height,
            },
        });
        y += line_height + LINE_GAP;
    }
    if !lines.is_empty() {
        y -= LINE_GAP;
    }

    let card_height = (y + PADDING - MARGIN).min(height.saturating_sub(MARGIN));
    let (primary, secondary) = meta.accent_colors();

    Some(CardLayout {
        card: Rect {
            x,
            y: MARGIN,
            width: card_width,
            height: card_height,
        },
        accent,
        lines,
        primary,
        secondary,
    })
}

/// Blend the card panel and accent bar into `frame`.
pub fn paint(frame: &mut RgbaImage, card: &CardLayout) {
    let (fw, fh) = frame.dimensions();
    let Rect { x, y, width, height } = card.card;
    let span = (width + height).max(1) as f32;

    for py in y..(y + height).min(fh) {
        for px in x..(x + width).min(fw) {
            // Diagonal fade from 0.55 to 0.35
            let t = ((px - x) + (py - y)) as f32 / span;
            let alpha = 0.55 - 0.2 * t;
            let on_edge = px == x || py == y || px + 1 == x + width || py + 1 == y + height;
            let (color, alpha) = if on_edge {
                ([255, 255, 255], 0.18)
            } else {
                ([20, 20, 20], alpha)
            };
            blend(frame.get_pixel_mut(px, py), color, alpha);
        }
    }

    let accent = card.accent;
    let denom = accent.width.saturating_sub(1).max(1) as f32;
    for px in accent.x..(accent.x + accent.width).min(fw) {
        let t = (px - accent.x) as f32 / denom;
        let color = lerp_rgb(card.primary, card.secondary, t);
        for py in accent.y..(accent.y + accent.height).min(fh) {
            blend(frame.get_pixel_mut(px, py), color, 1.0);
        }
    }
}

fn blend(pixel: &mut Rgba<u8>, color: [u8; 3], alpha: f32) {
    for c in 0..3 {
        let v = pixel[c] as f32 * (1.0 - alpha) + color[c] as f32 * alpha;
        pixel[c] = v.round().clamp(0.0, 255.0) as u8;
    }
    pixel[3] = 255;
}

fn lerp_rgb(a: [u8; 3], b: [u8; 3], t: f32) -> [u8; 3] {
    let mut out = [0u8; 3];
    for c in 0..3 {
        out[c] = (a[c] as f32 + (b[c] as f32 - a[c] as f32) * t).round() as u8;
    }
    out
}
