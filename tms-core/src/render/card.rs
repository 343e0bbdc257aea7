use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};

use crate::config::TmsSettings;
use crate::snapshot::ActiveSnapshot;

use super::font::{chars_per_line, draw_text, text_height, text_width, wrap};

pub const WIDTH: u32 = 1920;
pub const HEIGHT: u32 = 1080;

const CONTENT_WIDTH: u32 = 1440;
const CARD_SPACING: u32 = 24;
const CARD_HEIGHT: u32 = 200;
const GRID_TOP: u32 = 350;
const CARD_PADDING: u32 = 24;
const ICON_SIZE: u32 = 80;
const DESCRIPTION_WRAP: usize = 100;
const NAME_LINES: usize = 3;

const TITLE_SCALE: u32 = 7;
const DESCRIPTION_SCALE: u32 = 3;
const NAME_SCALE: u32 = 3;
const PILL_SCALE: u32 = 2;

const SECONDARY_TEXT: Rgba<u8> = Rgba([148, 163, 184, 255]);
const UNAVAILABLE: Rgba<u8> = Rgba([239, 68, 68, 255]);
pub const UNAVAILABLE_TEXT: &str = "This Channel is Unavailable";

#[derive(Debug, Clone, Copy)]
pub struct Theme {
    pub background: Rgba<u8>,
    pub card: Rgba<u8>,
    pub card_border: Rgba<u8>,
    pub text: Rgba<u8>,
    pub accent: Rgba<u8>,
    pub accent_text: Rgba<u8>,
}

impl Theme {
    pub fn from_settings(settings: &TmsSettings) -> Self {
        Self {
            background: hex_color(&settings.theme_bg_color, [15, 23, 42]),
            card: hex_color(&settings.theme_card_bg_color, [30, 41, 59]),
            card_border: hex_color(&settings.theme_card_border_color, [51, 65, 85]),
            text: hex_color(&settings.theme_text_color, [248, 250, 252]),
            accent: hex_color(&settings.theme_accent_color, [56, 189, 248]),
            accent_text: hex_color(&settings.theme_accent_text_color, [15, 23, 42]),
        }
    }
}

/// Parses `#rrggbb`, falling back to `default` on anything else.
pub fn hex_color(value: &str, default: [u8; 3]) -> Rgba<u8> {
    let hex = value.trim().trim_start_matches('#');
    let parsed = (hex.len() == 6 && hex.is_ascii())
        .then(|| {
            let channel = |idx: usize| u8::from_str_radix(&hex[idx..idx + 2], 16).ok();
            Some([channel(0)?, channel(2)?, channel(4)?])
        })
        .flatten();
    let [r, g, b] = parsed.unwrap_or(default);
    Rgba([r, g, b, 255])
}

/// Draws the placeholder card grid. `logos` is indexed like
/// `snapshot.channels`.
pub fn compose(
    settings: &TmsSettings,
    snapshot: &ActiveSnapshot,
    logos: &[Option<RgbaImage>],
) -> RgbaImage {
    let theme = Theme::from_settings(settings);
    let mut canvas = RgbaImage::from_pixel(WIDTH, HEIGHT, theme.background);

    if snapshot.is_empty() {
        let x = (WIDTH - text_width(UNAVAILABLE_TEXT, TITLE_SCALE)) / 2;
        let y = (HEIGHT - text_height(TITLE_SCALE)) / 2;
        draw_text(
            &mut canvas,
            x as i64,
            y as i64,
            UNAVAILABLE_TEXT,
            TITLE_SCALE,
            UNAVAILABLE,
        );
        return canvas;
    }

    draw_centered(&mut canvas, 100, &settings.stream_title, TITLE_SCALE, theme.text);
    let mut y = 180;
    for line in wrap(&settings.stream_description, DESCRIPTION_WRAP) {
        draw_centered(&mut canvas, y, &line, DESCRIPTION_SCALE, SECONDARY_TEXT);
        y += 32;
    }

    let cols = settings.columns();
    let margin = (WIDTH - CONTENT_WIDTH) / 2;
    let card_width = CONTENT_WIDTH.saturating_sub(CARD_SPACING.saturating_mul(cols - 1)) / cols;
    for (index, channel) in snapshot.channels.iter().enumerate() {
        let index = index as u32;
        let (col, row) = (index % cols, index / cols);
        let x = margin + col * (card_width + CARD_SPACING);
        let y = GRID_TOP + row * (CARD_HEIGHT + CARD_SPACING);
        let logo = logos.get(index as usize).and_then(Option::as_ref);
        draw_card(
            &mut canvas,
            &theme,
            (x, y, card_width),
            &channel.number,
            &channel.name,
            logo,
        );
    }
    canvas
}

fn draw_centered(canvas: &mut RgbaImage, y: u32, text: &str, scale: u32, color: Rgba<u8>) {
    let x = (WIDTH as i64 - text_width(text, scale) as i64) / 2;
    draw_text(canvas, x, y as i64, text, scale, color);
}

fn draw_card(
    canvas: &mut RgbaImage,
    theme: &Theme,
    (x, y, width): (u32, u32, u32),
    number: &str,
    name: &str,
    logo: Option<&RgbaImage>,
) {
    fill_rounded(canvas, x, y, width, CARD_HEIGHT, 12, theme.card_border);
    fill_rounded(
        canvas,
        x + 2,
        y + 2,
        width.saturating_sub(4),
        CARD_HEIGHT - 4,
        10,
        theme.card,
    );

    let pill = format!("CH {}", number.trim_start_matches('#'));
    let pill_width = text_width(&pill, PILL_SCALE) + 24;
    let pill_height = text_height(PILL_SCALE) + 12;
    let (pill_x, pill_y) = (x + CARD_PADDING, y + CARD_PADDING);
    fill_rounded(canvas, pill_x, pill_y, pill_width, pill_height, 6, theme.accent);
    draw_text(
        canvas,
        (pill_x + 12) as i64,
        (pill_y + 6) as i64,
        &pill,
        PILL_SCALE,
        theme.accent_text,
    );

    let (icon_x, icon_y) = (pill_x, pill_y + pill_height + 16);
    match logo {
        Some(logo) => {
            fill_rounded(canvas, icon_x, icon_y, ICON_SIZE, ICON_SIZE, 8, theme.card_border);
            fill_rounded(
                canvas,
                icon_x + 1,
                icon_y + 1,
                ICON_SIZE - 2,
                ICON_SIZE - 2,
                7,
                theme.background,
            );
            let thumb = imageops::resize(
                logo,
                fit(logo.width(), ICON_SIZE, logo.height()),
                fit(logo.height(), ICON_SIZE, logo.width()),
                FilterType::Lanczos3,
            );
            imageops::overlay(canvas, &thumb, icon_x as i64, icon_y as i64);
        }
        None => fill_rounded(canvas, icon_x, icon_y, ICON_SIZE, ICON_SIZE, 0, theme.background),
    }

    let name_x = icon_x + ICON_SIZE + 16;
    let max_name_width = width.saturating_sub(CARD_PADDING * 2 + ICON_SIZE + 20);
    let lines = wrap(name, chars_per_line(max_name_width, NAME_SCALE));
    for (idx, line) in lines.iter().take(NAME_LINES).enumerate() {
        draw_text(
            canvas,
            name_x as i64,
            (icon_y + 5 + idx as u32 * 28) as i64,
            line,
            NAME_SCALE,
            theme.text,
        );
    }
}

/// Side length of `side` after scaling the image into a `bound` square,
/// keeping its aspect ratio.
fn fit(side: u32, bound: u32, other: u32) -> u32 {
    let longest = side.max(other).max(1);
    if longest <= bound {
        return side.max(1);
    }
    ((side as u64 * bound as u64) / longest as u64).max(1) as u32
}

fn fill_rounded(
    canvas: &mut RgbaImage,
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    radius: u32,
    color: Rgba<u8>,
) {
    let radius = radius.min(width / 2).min(height / 2) as i64;
    let (canvas_w, canvas_h) = canvas.dimensions();
    for dy in 0..height as i64 {
        for dx in 0..width as i64 {
            let cx = if dx < radius {
                radius - dx
            } else if dx >= width as i64 - radius {
                dx - (width as i64 - radius - 1)
            } else {
                0
            };
            let cy = if dy < radius {
                radius - dy
            } else if dy >= height as i64 - radius {
                dy - (height as i64 - radius - 1)
            } else {
                0
            };
            if cx > 0 && cy > 0 && cx * cx + cy * cy > radius * radius {
                continue;
            }
            let (px, py) = (x as i64 + dx, y as i64 + dy);
            if px < canvas_w as i64 && py < canvas_h as i64 {
                canvas.put_pixel(px as u32, py as u32, color);
            }
        }
    }
}
