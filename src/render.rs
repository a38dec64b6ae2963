//! HTML documents produced by the site build itself.
//!
//! - **Markdown pages**: `about.md` becomes a complete HTML page whose title is
//!   the first `# heading`.
//! - **Error documents**: self-contained pages for HTTP error statuses, used
//!   for the site's not-found response.
//! - **AUTOHEAD**: a line consisting of `<!--AUTOHEAD-->` in an HTML page is
//!   replaced by the page's canonical link (and the favicon link, when the site
//!   has one), keeping the line's indentation.
//!
//! Uses [maud](https://maud.lambda.xyz/) for templating, so titles taken from
//! user content are escaped.

use maud::{DOCTYPE, Markup, PreEscaped, html};
use pulldown_cmark::{Options, Parser, html as md_html};
use regex::bytes::{Captures, Regex};
use std::sync::LazyLock;

pub const AUTOHEAD_MARKER: &str = "<!--AUTOHEAD-->";

static AUTOHEAD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"((?:\n|^)[ \t]*)<!--AUTOHEAD-->").expect("autohead pattern is a valid regex")
});

const ERROR_CSS: &str = r#"html,body{color:#000000;background-color:#aaddff;}
html,body,div,h1,p,a{margin:0;padding:0;border:0;font:36px bold;font-family:"Lucida Sans Unicode","Lucida Grande",serif;text-align:center;}
html,body,#d1{height:100%;width:100%;}
#d1{display:table;}
#d2{display:table-cell;vertical-align:middle;}
#d3{background-color:#ffddaa;padding:10px 20px;display:inline-block;}
h1{color:#ff4444;}
p,a{color:#008800;}"#;

const RETRY_SCRIPT: &str = "document.getElementById('retry').innerHTML = \
'<p><a href=\"javascript:location.reload(true)\">Try again?</a></p>';";

/// An HTTP error status with a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpError {
    pub code: u16,
    pub reason: &'static str,
    /// Whether trying again might help; such pages offer a reload link.
    pub retryable: bool,
}

const fn err(code: u16, reason: &'static str, retryable: bool) -> HttpError {
    HttpError { code, reason, retryable }
}

pub const HTTP_ERRORS: &[HttpError] = &[
    err(400, "Bad Request", false),
    err(401, "Unauthorized", false),
    err(403, "Forbidden", false),
    err(404, "Not Found", false),
    err(405, "Method Not Allowed", false),
    err(406, "Not Acceptable", false),
    err(408, "Request Timeout", true),
    err(410, "Gone", false),
    err(411, "Length Required", true),
    err(412, "Precondition Failed", false),
    err(413, "Request Entity Too Large", false),
    err(414, "Request-URI Too Long", false),
    err(415, "Unsupported Media Type", false),
    err(416, "Requested Range Not Satisfiable", false),
    err(417, "Expectation Failed", false),
    err(500, "Internal Server Error", true),
    err(501, "Not Implemented", false),
    err(502, "Bad Gateway", false),
    err(503, "Service Unavailable", true),
    err(504, "Gateway Timeout", true),
    err(505, "HTTP Version Not Supported", false),
];

impl HttpError {
    pub fn from_code(code: u16) -> Option<Self> {
        HTTP_ERRORS.iter().copied().find(|e| e.code == code)
    }

    /// `404 Not Found`
    pub fn status_line(&self) -> String {
        format!("{} {}", self.code, self.reason)
    }
}

// ============================================================================
// HTML Components
// ============================================================================

/// Renders the base HTML document structure. The head carries an AUTOHEAD
/// line so generated pages get the same canonical link as hand-written ones.
fn base_document(title: &str, content: Markup) -> Markup {
    html! {
        (DOCTYPE)
        html lang="en" {
            head {
                meta charset="UTF-8";
                meta name="viewport" content="width=device-width, initial-scale=1.0";
                title { (title) }
                (PreEscaped("\n"))
                (PreEscaped(AUTOHEAD_MARKER))
                (PreEscaped("\n"))
            }
            body {
                (content)
            }
        }
    }
}

/// Title of a Markdown document: its first level-one ATX heading.
pub fn markdown_title(source: &str) -> Option<&str> {
    source
        .lines()
        .find_map(|line| line.strip_prefix("# "))
        .map(|title| title.trim().trim_end_matches('#').trim_end())
        .filter(|title| !title.is_empty())
}

/// Renders a Markdown source as a complete page.
pub fn markdown_page(source: &str, fallback_title: &str) -> Markup {
    let title = markdown_title(source).unwrap_or(fallback_title);

    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_FOOTNOTES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    let parser = Parser::new_ext(source, options);
    let mut body_html = String::new();
    md_html::push_html(&mut body_html, parser);

    let content = html! {
        main {
            article {
                (PreEscaped(body_html))
            }
        }
    };
    base_document(title, content)
}

/// Renders the self-contained document for an error status.
pub fn error_document(error: HttpError) -> Markup {
    let status = error.status_line();
    html! {
        (DOCTYPE)
        html {
            head {
                meta charset="utf-8";
                meta name="robots" content="noindex, noarchive, nosnippet";
                title { (status) }
                style { (PreEscaped(ERROR_CSS)) }
            }
            body {
                div #d1 { div #d2 { div #d3 {
                    @if error.retryable {
                        div #retry {}
                        script { (PreEscaped(RETRY_SCRIPT)) }
                    }
                    h1 { (status) }
                    p { a href="/" { "Return to the home page" } }
                } } }
            }
        }
    }
}

/// Replace every AUTOHEAD line in `page` with head links for `canonical_url`.
pub fn autohead(page: &[u8], canonical_url: &str, favicon_ref: Option<&str>) -> Vec<u8> {
    let canonical = maud::html! { link rel="canonical" href=(canonical_url); }.into_string();
    let icon = favicon_ref.map(|href| maud::html! { link rel="shortcut icon" href=(href); }.into_string());
    AUTOHEAD
        .replace_all(page, |caps: &Captures| {
            let indent = &caps[1];
            let mut out = indent.to_vec();
            out.extend_from_slice(canonical.as_bytes());
            if let Some(icon) = &icon {
                out.extend_from_slice(indent);
                out.extend_from_slice(icon.as_bytes());
            }
            out
        })
        .into_owned()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markdown_title_takes_first_heading() {
        assert_eq!(markdown_title("intro\n# Hello #\n# Second"), Some("Hello"));
        assert_eq!(markdown_title("## Only h2"), None);
        assert_eq!(markdown_title("#   "), None);
    }

    #[test]
    fn markdown_page_converts_markdown() {
        let page = markdown_page("# About Me\n\nThis is **bold** and *italic*.", "about").into_string();
        assert!(page.starts_with("<!DOCTYPE html>"));
        assert!(page.contains("<title>About Me</title>"));
        assert!(page.contains("<strong>bold</strong>"));
        assert!(page.contains("<em>italic</em>"));
        assert!(page.contains("\n<!--AUTOHEAD-->\n"));
    }

    #[test]
    fn markdown_page_falls_back_to_stem() {
        let page = markdown_page("no heading", "notes").into_string();
        assert!(page.contains("<title>notes</title>"));
    }

    #[test]
    fn markdown_title_is_escaped() {
        let page = markdown_page("# <script>x</script>", "t").into_string();
        assert!(page.contains("<title>&lt;script&gt;x&lt;/script&gt;</title>"));
    }

    #[test]
    fn error_document_for_404() {
        let doc = error_document(HttpError::from_code(404).unwrap()).into_string();
        assert!(doc.contains("<title>404 Not Found</title>"));
        assert!(doc.contains("noindex, noarchive, nosnippet"));
        assert!(!doc.contains("Try again"));
    }

    #[test]
    fn retryable_errors_offer_reload() {
        let doc = error_document(HttpError::from_code(503).unwrap()).into_string();
        assert!(doc.contains("Try again?"));
    }

    #[test]
    fn unknown_status_has_no_document() {
        assert!(HttpError::from_code(418).is_none());
    }

    // =========================================================================
    // AUTOHEAD
    // =========================================================================

    #[test]
    fn autohead_keeps_indentation() {
        let page = b"<head>\n    <!--AUTOHEAD-->\n</head>";
        let out = autohead(page, "http://www.example.com/a", Some("/favicon.ico?rr"));
        let out = String::from_utf8(out).unwrap();
        assert_eq!(
            out,
            "<head>\n    <link rel=\"canonical\" href=\"http://www.example.com/a\">\n    <link rel=\"shortcut icon\" href=\"/favicon.ico?rr\">\n</head>"
        );
    }

    #[test]
    fn autohead_without_icon() {
        let out = autohead(b"<!--AUTOHEAD-->", "http://x.example/", None);
        assert_eq!(out, b"<link rel=\"canonical\" href=\"http://x.example/\">");
    }

    #[test]
    fn autohead_ignores_mid_line_marker() {
        let page = b"<title>t</title><!--AUTOHEAD-->";
        assert_eq!(autohead(page, "http://x.example/", None), page.to_vec());
    }
}
