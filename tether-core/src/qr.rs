//! Render raw pairing payloads into displayable QR images.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use qrcode::render::svg;
use qrcode::types::QrError;
use qrcode::QrCode;

const MIN_DIMENSION: u32 = 256;

/// Render `raw` as an SVG QR code wrapped in a `data:` URL.
pub fn render_data_url(raw: &str) -> Result<String, QrError> {
    let code = QrCode::new(raw.as_bytes())?;
    let image = code
        .render()
        .min_dimensions(MIN_DIMENSION, MIN_DIMENSION)
        .dark_color(svg::Color("#000000"))
        .light_color(svg::Color("#ffffff"))
        .build();
    Ok(format!("data:image/svg+xml;base64,{}", STANDARD.encode(image)))
}

/// Like `render_data_url`, but falls back to the raw payload when it cannot be
/// encoded so callers can still render it client-side.
pub fn render_or_raw(raw: &str) -> String {
    match render_data_url(raw) {
        Ok(url) => url,
        Err(e) => {
            tracing::warn!(error = %e, "QR rendering failed, passing raw payload through");
            raw.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_svg_data_url() {
        let url = render_data_url("2@abc,def,ghi==").unwrap();
        assert!(url.starts_with("data:image/svg+xml;base64,"));

        let encoded = url.trim_start_matches("data:image/svg+xml;base64,");
        let svg = String::from_utf8(STANDARD.decode(encoded).unwrap()).unwrap();
        assert!(svg.contains("<svg"));
    }

    #[test]
    fn oversized_payload_falls_back_to_raw() {
        let raw = "x".repeat(8000);
        assert!(render_data_url(&raw).is_err());
        assert_eq!(render_or_raw(&raw), raw);
    }
}
