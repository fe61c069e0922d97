//! The page theme: colour palettes, fonts, a text size scale and named style overrides,
//! rendered to CSS custom properties for light and dark mode.
//!
//! Values may reference other variables as `*name`, e.g. `*secondary_500`, which render as
//! `var(--secondary-500)`.

use std::collections::BTreeMap;

pub const SHADES: [&str; 11] = [
    "50", "100", "200", "300", "400", "500", "600", "700", "800", "900", "950",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Color {
    pub name: &'static str,
    /// One value per entry of [`SHADES`].
    pub shades: [&'static str; 11],
}

pub const ORANGE_RED: Color = Color {
    name: "orange_red",
    shades: [
        "#FFF0E5", "#FFE0CC", "#FFC299", "#FFA366", "#FF8533", "#FF4500", "#E63E00", "#CC3700",
        "#B33000", "#992900", "#802200",
    ],
};

pub const GRAY: Color = Color {
    name: "gray",
    shades: [
        "#f9fafb", "#f3f4f6", "#e5e7eb", "#d1d5db", "#9ca3af", "#6b7280", "#4b5563", "#374151",
        "#1f2937", "#111827", "#0b0f19",
    ],
};

pub const SLATE: Color = Color {
    name: "slate",
    shades: [
        "#f8fafc", "#f1f5f9", "#e2e8f0", "#cbd5e1", "#94a3b8", "#64748b", "#475569", "#334155",
        "#1e293b", "#0f172a", "#0a0f1e",
    ],
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Size {
    pub name: &'static str,
    pub xxs: &'static str,
    pub xs: &'static str,
    pub sm: &'static str,
    pub md: &'static str,
    pub lg: &'static str,
    pub xl: &'static str,
    pub xxl: &'static str,
}

impl Size {
    fn steps(&self) -> [(&'static str, &'static str); 7] {
        [
            ("xxs", self.xxs),
            ("xs", self.xs),
            ("sm", self.sm),
            ("md", self.md),
            ("lg", self.lg),
            ("xl", self.xl),
            ("xxl", self.xxl),
        ]
    }
}

pub const TEXT_LG: Size = Size {
    name: "text_lg",
    xxs: "10px",
    xs: "12px",
    sm: "14px",
    md: "16px",
    lg: "20px",
    xl: "24px",
    xxl: "28px",
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Font {
    /// Loaded from Google Fonts.
    Google(&'static str),
    System(&'static str),
}

impl Font {
    fn css_name(&self) -> String {
        match self {
            Font::Google(name) => format!("'{name}'"),
            Font::System(name) if name.contains(' ') => format!("'{name}'"),
            Font::System(name) => name.to_string(),
        }
    }
}

fn font_stack(fonts: &[Font]) -> String {
    fonts
        .iter()
        .map(Font::css_name)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Style defaults of the soft base theme, as `(variable, light, dark)`.
const SOFT_BASE: &[(&str, &str, &str)] = &[
    ("body_background_fill", "*background_fill_primary", "*background_fill_primary"),
    ("body_text_color", "*neutral_800", "*neutral_100"),
    ("body_text_color_subdued", "*neutral_500", "*neutral_400"),
    ("body_text_size", "*text_md", "*text_md"),
    ("background_fill_primary", "white", "*neutral_950"),
    ("background_fill_secondary", "*neutral_50", "*neutral_900"),
    ("block_background_fill", "white", "*neutral_800"),
    ("block_border_color", "*neutral_200", "*neutral_700"),
    ("block_border_width", "1px", "1px"),
    ("block_label_background_fill", "*primary_100", "*primary_600"),
    ("block_label_text_color", "*primary_500", "white"),
    ("block_radius", "16px", "16px"),
    ("block_shadow", "none", "none"),
    ("block_title_text_weight", "400", "400"),
    ("button_large_padding", "12px 24px", "12px 24px"),
    ("button_primary_background_fill", "*primary_500", "*primary_600"),
    ("button_primary_background_fill_hover", "*primary_400", "*primary_500"),
    ("button_primary_shadow", "none", "none"),
    ("button_primary_text_color", "white", "white"),
    ("button_primary_text_color_hover", "white", "white"),
    ("button_secondary_background_fill", "white", "*neutral_700"),
    ("button_secondary_background_fill_hover", "*neutral_100", "*neutral_600"),
    ("button_secondary_text_color", "*neutral_800", "white"),
    ("button_secondary_text_color_hover", "*neutral_800", "white"),
    ("color_accent_soft", "*primary_50", "*neutral_700"),
    ("input_background_fill", "*neutral_50", "*neutral_700"),
    ("input_border_color", "*neutral_200", "*neutral_600"),
    ("shadow_drop_lg", "0 1px 3px 0 rgb(0 0 0 / 0.1), 0 1px 2px -1px rgb(0 0 0 / 0.1)", "0 1px 3px 0 rgb(0 0 0 / 0.3)"),
    ("slider_color", "*primary_500", "*primary_600"),
];

#[derive(Debug, Clone, PartialEq)]
pub struct Theme {
    pub primary_hue: Color,
    pub secondary_hue: Color,
    pub neutral_hue: Color,
    pub text_size: Size,
    pub font: Vec<Font>,
    pub font_mono: Vec<Font>,
    /// Named overrides. Names ending in `_dark` apply to dark mode only.
    pub overrides: Vec<(&'static str, &'static str)>,
}

impl Theme {
    /// Soft base with a gray primary, orange-red secondary and slate neutral hue.
    pub fn orange_red() -> Self {
        Self {
            primary_hue: GRAY,
            secondary_hue: ORANGE_RED,
            neutral_hue: SLATE,
            text_size: TEXT_LG,
            font: vec![
                Font::Google("Outfit"),
                Font::System("Arial"),
                Font::System("sans-serif"),
            ],
            font_mono: vec![
                Font::Google("IBM Plex Mono"),
                Font::System("ui-monospace"),
                Font::System("monospace"),
            ],
            overrides: vec![
                ("background_fill_primary", "*primary_50"),
                ("background_fill_primary_dark", "*primary_900"),
                ("body_background_fill", "linear-gradient(135deg, *primary_200, *primary_100)"),
                ("body_background_fill_dark", "linear-gradient(135deg, *primary_900, *primary_800)"),
                ("button_primary_text_color", "white"),
                ("button_primary_text_color_hover", "white"),
                ("button_primary_background_fill", "linear-gradient(90deg, *secondary_500, *secondary_600)"),
                ("button_primary_background_fill_hover", "linear-gradient(90deg, *secondary_600, *secondary_700)"),
                ("button_primary_background_fill_dark", "linear-gradient(90deg, *secondary_600, *secondary_700)"),
                ("button_primary_background_fill_hover_dark", "linear-gradient(90deg, *secondary_500, *secondary_600)"),
                ("button_secondary_text_color", "black"),
                ("button_secondary_text_color_hover", "white"),
                ("button_secondary_background_fill", "linear-gradient(90deg, *primary_300, *primary_300)"),
                ("button_secondary_background_fill_hover", "linear-gradient(90deg, *primary_400, *primary_400)"),
                ("button_secondary_background_fill_dark", "linear-gradient(90deg, *primary_500, *primary_600)"),
                ("button_secondary_background_fill_hover_dark", "linear-gradient(90deg, *primary_500, *primary_500)"),
                ("slider_color", "*secondary_500"),
                ("slider_color_dark", "*secondary_600"),
                ("block_title_text_weight", "600"),
                ("block_border_width", "3px"),
                ("block_shadow", "*shadow_drop_lg"),
                ("button_primary_shadow", "*shadow_drop_lg"),
                ("button_large_padding", "11px"),
                ("color_accent_soft", "*primary_100"),
                ("block_label_background_fill", "*primary_200"),
            ],
        }
    }

    /// Every variable of one mode, with references left unresolved.
    pub fn variables(&self, dark: bool) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        for (role, color) in [
            ("primary", &self.primary_hue),
            ("secondary", &self.secondary_hue),
            ("neutral", &self.neutral_hue),
        ] {
            for (shade, value) in SHADES.iter().zip(color.shades.iter()) {
                vars.insert(format!("{role}_{shade}"), value.to_string());
            }
        }
        for (step, value) in self.text_size.steps() {
            vars.insert(format!("text_{step}"), value.to_string());
        }
        vars.insert("font".into(), font_stack(&self.font));
        vars.insert("font_mono".into(), font_stack(&self.font_mono));

        for (name, light, dark_value) in SOFT_BASE {
            let value = if dark { dark_value } else { light };
            vars.insert(name.to_string(), value.to_string());
        }
        // light overrides apply to both modes, `_dark` ones then take precedence in dark mode
        for (name, value) in &self.overrides {
            if !name.ends_with("_dark") {
                vars.insert(name.to_string(), value.to_string());
            }
        }
        if dark {
            for (name, value) in &self.overrides {
                if let Some(name) = name.strip_suffix("_dark") {
                    vars.insert(name.to_string(), value.to_string());
                }
            }
        }
        vars
    }

    /// Stylesheet holding the Google font imports, the light variables on `:root` and the dark
    /// ones on `.dark`.
    pub fn to_css(&self) -> String {
        let mut css = String::new();
        for font in self.font.iter().chain(self.font_mono.iter()) {
            if let Font::Google(name) = font {
                css.push_str(&format!(
                    "@import url('https://fonts.googleapis.com/css2?family={}:wght@400;600&display=swap');\n",
                    name.replace(' ', "+")
                ));
            }
        }
        for (selector, dark) in [(":root", false), (".dark", true)] {
            css.push_str(selector);
            css.push_str(" {\n");
            for (name, value) in self.variables(dark) {
                css.push_str(&format!("  {}: {};\n", css_var_name(&name), resolve(&value)));
            }
            css.push_str("}\n");
        }
        css
    }
}

fn css_var_name(name: &str) -> String {
    format!("--{}", name.replace('_', "-"))
}

/// Replaces every `*name` reference with `var(--name)`.
pub fn resolve(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '*' {
            out.push(c);
            continue;
        }
        let mut name = String::new();
        while let Some(&next) = chars.peek() {
            if next.is_ascii_alphanumeric() || next == '_' {
                name.push(next);
                chars.next();
            } else {
                break;
            }
        }
        if name.is_empty() {
            out.push('*');
        } else {
            out.push_str(&format!("var({})", css_var_name(&name)));
        }
    }
    out
}
