//! Report computation collaborators: data source, template renderer, and
//! PDF engine.
//!
//! The upstream analytics source, the template fetch mechanism, and the PDF
//! engine are external systems; these traits are their seams. The bundled
//! implementations serve dev mode and tests: `InlineDataSource` reads rows
//! embedded in the query spec, `TableTemplateRenderer` builds the standard
//! report document, and `TextPdfRenderer` produces a single-page PDF from
//! the document text.

use async_trait::async_trait;
use chrono::Utc;

use crate::dates::DateRange;
use crate::pdf::write_single_page_pdf;

#[derive(thiserror::Error, Debug)]
pub enum RenderError {
    /// Data-source failures are transient from the pipeline's perspective.
    #[error("data source: {0}")]
    Source(String),

    #[error("template: {0}")]
    Template(String),

    #[error("pdf: {0}")]
    Pdf(String),
}

#[async_trait]
pub trait DataSource: Send + Sync {
    /// Execute the definition's query spec over the optional date range.
    async fn query(
        &self,
        query_spec: &serde_json::Value,
        date_range: Option<&DateRange>,
    ) -> Result<serde_json::Value, RenderError>;
}

#[async_trait]
pub trait TemplateRenderer: Send + Sync {
    async fn render(
        &self,
        template_ref: &str,
        data: &serde_json::Value,
        report_name: &str,
    ) -> Result<String, RenderError>;
}

#[async_trait]
pub trait PdfRenderer: Send + Sync {
    async fn render(&self, html: &str) -> Result<Vec<u8>, RenderError>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Bundled implementations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Serves the rows carried inline in the query spec (`"rows": [...]`).
pub struct InlineDataSource;

#[async_trait]
impl DataSource for InlineDataSource {
    async fn query(
        &self,
        query_spec: &serde_json::Value,
        date_range: Option<&DateRange>,
    ) -> Result<serde_json::Value, RenderError> {
        let rows = query_spec
            .get("rows")
            .cloned()
            .unwrap_or_else(|| serde_json::json!([]));
        if !rows.is_array() {
            return Err(RenderError::Source("query_spec.rows must be an array".into()));
        }
        Ok(serde_json::json!({
            "rows": rows,
            "generated_at": Utc::now().to_rfc3339(),
            "date_range": date_range,
        }))
    }
}

/// Renders the standard report document: a heading, the generation stamp,
/// and a table over `data.rows`.
pub struct TableTemplateRenderer;

#[async_trait]
impl TemplateRenderer for TableTemplateRenderer {
    async fn render(
        &self,
        template_ref: &str,
        data: &serde_json::Value,
        report_name: &str,
    ) -> Result<String, RenderError> {
        tracing::debug!(template_ref, "rendering report template");
        let rows = data
            .get("rows")
            .and_then(|r| r.as_array())
            .ok_or_else(|| RenderError::Template("data.rows missing".into()))?;
        let generated_at = data
            .get("generated_at")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        // Column order comes from the first row, alphabetically.
        let mut columns: Vec<String> = rows
            .first()
            .and_then(|r| r.as_object())
            .map(|o| o.keys().cloned().collect())
            .unwrap_or_default();
        columns.sort();

        let mut html = String::new();
        html.push_str("<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"UTF-8\">\n");
        html.push_str(&format!("<title>{}</title>\n", html_escape(report_name)));
        html.push_str(
            "<style>\nbody { font-family: Arial, sans-serif; margin: 40px; }\n\
             h1 { color: #1976D2; }\n\
             table { border-collapse: collapse; width: 100%; margin-top: 20px; }\n\
             th, td { border: 1px solid #ddd; padding: 12px; text-align: left; }\n\
             th { background-color: #1976D2; color: white; }\n\
             tr:nth-child(even) { background-color: #f9f9f9; }\n\
             .footer { margin-top: 40px; color: #666; font-size: 12px; }\n</style>\n",
        );
        html.push_str("</head>\n<body>\n");
        html.push_str(&format!("<h1>{}</h1>\n", html_escape(report_name)));
        html.push_str(&format!(
            "<p><strong>Generated:</strong> {}</p>\n",
            html_escape(&generated_at)
        ));

        html.push_str("<table>\n<thead>\n<tr>");
        for column in &columns {
            html.push_str(&format!("<th>{}</th>", html_escape(column)));
        }
        html.push_str("</tr>\n</thead>\n<tbody>\n");
        for row in rows {
            html.push_str("<tr>");
            for column in &columns {
                let cell = match row.get(column) {
                    Some(serde_json::Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                html.push_str(&format!("<td>{}</td>", html_escape(&cell)));
            }
            html.push_str("</tr>\n");
        }
        html.push_str("</tbody>\n</table>\n");
        html.push_str(
            "<div class=\"footer\"><p>This report was automatically generated by Courier.</p></div>\n",
        );
        html.push_str("</body>\n</html>\n");
        Ok(html)
    }
}

fn html_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Extracts the document text and lays it out on a single PDF page.
pub struct TextPdfRenderer;

#[async_trait]
impl PdfRenderer for TextPdfRenderer {
    async fn render(&self, html: &str) -> Result<Vec<u8>, RenderError> {
        let lines = text_lines(html);
        if lines.is_empty() {
            return Err(RenderError::Pdf("document has no text content".into()));
        }
        Ok(write_single_page_pdf(&lines))
    }
}

/// Strip tags and collect non-empty text lines. Table cells become
/// tab-separated columns.
fn text_lines(html: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut in_tag = false;
    let mut tag = String::new();
    let mut in_style = false;

    for ch in html.chars() {
        match ch {
            '<' => {
                in_tag = true;
                tag.clear();
            }
            '>' => {
                in_tag = false;
                let name = tag
                    .trim_start_matches('/')
                    .split_whitespace()
                    .next()
                    .unwrap_or("")
                    .to_ascii_lowercase();
                match name.as_str() {
                    "style" => in_style = !tag.starts_with('/'),
                    "td" | "th" if tag.starts_with('/') => current.push('\t'),
                    "tr" | "p" | "h1" | "h2" | "h3" | "div" | "br" | "table" => {
                        let line = current.trim().trim_end_matches('\t').to_string();
                        if !line.is_empty() {
                            lines.push(line);
                        }
                        current.clear();
                    }
                    _ => {}
                }
            }
            c if in_tag => tag.push(c),
            c if !in_style => current.push(c),
            _ => {}
        }
    }
    let tail = current.trim().to_string();
    if !tail.is_empty() {
        lines.push(tail);
    }
    lines
        .into_iter()
        .map(|l| l.replace("&amp;", "&").replace("&lt;", "<").replace("&gt;", ">"))
        .collect()
}
