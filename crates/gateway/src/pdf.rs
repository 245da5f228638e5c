//! Minimal single-page PDF writer.
//!
//! Emits a complete PDF 1.4 document: catalog, page tree, one Letter-sized
//! page, a Helvetica font resource, and a text content stream with one `Tj`
//! per line. Enough for report payloads without pulling in a rendering
//! engine; swapping in a real converter only touches the `PdfRenderer`
//! collaborator.

/// Page height in points (US Letter).
const PAGE_HEIGHT: f32 = 792.0;
const PAGE_WIDTH: f32 = 612.0;
const MARGIN: f32 = 50.0;
const LEADING: f32 = 14.0;
const FONT_SIZE: f32 = 10.0;

/// Escape a text line for a PDF string literal.
fn escape(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    for ch in line.chars() {
        match ch {
            '(' => out.push_str("\\("),
            ')' => out.push_str("\\)"),
            '\\' => out.push_str("\\\\"),
            // The standard fonts are Latin-1; anything else degrades to '?'.
            c if (c as u32) < 256 => out.push(c),
            _ => out.push('?'),
        }
    }
    out
}

/// Render text lines into a single-page PDF document.
pub fn write_single_page_pdf(lines: &[String]) -> Vec<u8> {
    let max_lines = ((PAGE_HEIGHT - 2.0 * MARGIN) / LEADING) as usize;

    let mut content = String::new();
    content.push_str("BT\n");
    content.push_str(&format!("/F1 {FONT_SIZE} Tf\n"));
    content.push_str(&format!("{LEADING} TL\n"));
    content.push_str(&format!("{MARGIN} {} Td\n", PAGE_HEIGHT - MARGIN));
    for line in lines.iter().take(max_lines) {
        content.push_str(&format!("({}) Tj T*\n", escape(line)));
    }
    content.push_str("ET\n");

    let objects = [
        "<< /Type /Catalog /Pages 2 0 R >>".to_string(),
        "<< /Type /Pages /Kids [3 0 R] /Count 1 >>".to_string(),
        format!(
            "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 {PAGE_WIDTH} {PAGE_HEIGHT}] \
             /Resources << /Font << /F1 5 0 R >> >> /Contents 4 0 R >>"
        ),
        format!("<< /Length {} >>\nstream\n{content}endstream", content.len()),
        "<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica >>".to_string(),
    ];

    let mut out: Vec<u8> = Vec::new();
    out.extend_from_slice(b"%PDF-1.4\n");

    let mut offsets = Vec::with_capacity(objects.len());
    for (i, body) in objects.iter().enumerate() {
        offsets.push(out.len());
        out.extend_from_slice(format!("{} 0 obj\n{body}\nendobj\n", i + 1).as_bytes());
    }

    let xref_offset = out.len();
    out.extend_from_slice(format!("xref\n0 {}\n", objects.len() + 1).as_bytes());
    out.extend_from_slice(b"0000000000 65535 f \n");
    for offset in &offsets {
        out.extend_from_slice(format!("{offset:010} 00000 n \n").as_bytes());
    }
    out.extend_from_slice(
        format!(
            "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{xref_offset}\n%%EOF\n",
            objects.len() + 1
        )
        .as_bytes(),
    );
    out
}
