//! Incremental markdown renderer.
//!
//! `render` converts the *entire* accumulated text to HTML on every call —
//! re-rendering from scratch, never patching previous output. Input may be
//! incomplete (an unclosed code fence, a half-arrived link); every render is
//! self-contained and balanced, and all HTML metacharacters in the source
//! text are escaped before any markdown substitution.

use once_cell::sync::Lazy;
use regex::Regex;

static LINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[([^\]]+)\]\(([^)\s]+)\)").expect("link regex compiles"));
static BOLD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\*\*([^*]+)\*\*").expect("bold regex compiles"));
static ITALIC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\*([^*\s][^*]*)\*").expect("italic regex compiles"));
static ORDERED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+\.\s+(.*)$").expect("ordered-item regex compiles"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListKind {
    Unordered,
    Ordered,
}

impl ListKind {
    fn open_tag(self) -> &'static str {
        match self {
            ListKind::Unordered => "<ul>",
            ListKind::Ordered => "<ol>",
        }
    }
    fn close_tag(self) -> &'static str {
        match self {
            ListKind::Unordered => "</ul>",
            ListKind::Ordered => "</ol>",
        }
    }
}

/// Render accumulated markdown text as safe HTML.
pub fn render(text: &str) -> String {
    let text = if text.contains('\r') {
        text.replace('\r', "")
    } else {
        text.to_string()
    };
    let lines: Vec<&str> = text.split('\n').collect();

    // Pre-scan fence markers so an unterminated fence renders as plain text
    // instead of opening a <pre> that nothing closes.
    let fence_lines: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, l)| l.trim_start().starts_with("```"))
        .map(|(i, _)| i)
        .collect();
    let dangling_fence = if fence_lines.len() % 2 == 1 {
        fence_lines.last().copied()
    } else {
        None
    };

    let mut html = String::with_capacity(text.len() + text.len() / 4);
    let mut in_code = false;
    let mut open_list: Option<ListKind> = None;
    // Whether the previous emitted line was plain inline text; newlines
    // between such lines become <br>, newlines around blocks do not.
    let mut prev_inline = false;

    let close_list = |html: &mut String, open_list: &mut Option<ListKind>| {
        if let Some(kind) = open_list.take() {
            html.push_str(kind.close_tag());
        }
    };

    for (i, line) in lines.iter().enumerate() {
        let is_fence = line.trim_start().starts_with("```") && dangling_fence != Some(i);

        if in_code {
            if is_fence {
                html.push_str("</code></pre>");
                in_code = false;
                prev_inline = false;
            } else {
                html.push_str(&escape_html(line));
                html.push('\n');
            }
            continue;
        }

        if is_fence {
            close_list(&mut html, &mut open_list);
            html.push_str("<pre><code>");
            in_code = true;
            continue;
        }

        if let Some(rest) = line.strip_prefix("### ") {
            close_list(&mut html, &mut open_list);
            html.push_str(&format!("<h3>{}</h3>", render_inline(rest)));
            prev_inline = false;
        } else if let Some(rest) = line.strip_prefix("## ") {
            close_list(&mut html, &mut open_list);
            html.push_str(&format!("<h2>{}</h2>", render_inline(rest)));
            prev_inline = false;
        } else if let Some(rest) = line.strip_prefix("# ") {
            close_list(&mut html, &mut open_list);
            html.push_str(&format!("<h1>{}</h1>", render_inline(rest)));
            prev_inline = false;
        } else if let Some(rest) = line.strip_prefix("> ").or_else(|| {
            (*line == ">").then_some("")
        }) {
            close_list(&mut html, &mut open_list);
            html.push_str(&format!("<blockquote>{}</blockquote>", render_inline(rest)));
            prev_inline = false;
        } else if let Some(item) = line
            .strip_prefix("- ")
            .or_else(|| line.strip_prefix("* "))
        {
            if open_list != Some(ListKind::Unordered) {
                close_list(&mut html, &mut open_list);
                html.push_str(ListKind::Unordered.open_tag());
                open_list = Some(ListKind::Unordered);
            }
            html.push_str(&format!("<li>{}</li>", render_inline(item)));
            prev_inline = false;
        } else if let Some(caps) = ORDERED_RE.captures(line) {
            if open_list != Some(ListKind::Ordered) {
                close_list(&mut html, &mut open_list);
                html.push_str(ListKind::Ordered.open_tag());
                open_list = Some(ListKind::Ordered);
            }
            html.push_str(&format!("<li>{}</li>", render_inline(&caps[1])));
            prev_inline = false;
        } else {
            close_list(&mut html, &mut open_list);
            if prev_inline {
                html.push_str("<br>");
            }
            if dangling_fence == Some(i) {
                // An unterminated fence opener is plain text, backticks and all.
                html.push_str(&escape_html(line));
            } else {
                html.push_str(&render_inline(line));
            }
            prev_inline = true;
        }
    }

    // Fences are paired by the pre-scan, so in_code cannot survive the loop;
    // an open list at EOF still needs closing.
    close_list(&mut html, &mut open_list);
    html
}

/// Escape HTML metacharacters. Applied to every piece of source text before
/// any markdown substitution.
fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Inline markdown within one already-delimited line: code spans first (their
/// contents are exempt from further substitution), then links, bold, italic.
fn render_inline(line: &str) -> String {
    let escaped = escape_html(line);
    let parts: Vec<&str> = escaped.split('`').collect();
    if parts.len() == 1 {
        return render_spans(&escaped);
    }
    // Odd-index parts sit between backtick pairs; a trailing unpaired
    // backtick is re-emitted literally.
    let complete_spans = (parts.len() - 1) / 2;
    let mut spans_used = 0;
    let mut out = String::with_capacity(escaped.len());
    for (i, part) in parts.iter().enumerate() {
        if i % 2 == 1 && spans_used < complete_spans {
            out.push_str("<code>");
            out.push_str(part);
            out.push_str("</code>");
            spans_used += 1;
        } else if i % 2 == 1 {
            out.push('`');
            out.push_str(&render_spans(part));
        } else {
            out.push_str(&render_spans(part));
        }
    }
    out
}

fn render_spans(escaped: &str) -> String {
    let linked = LINK_RE.replace_all(escaped, |caps: &regex::Captures| {
        format!("<a href=\"{}\">{}</a>", safe_href(&caps[2]), &caps[1])
    });
    let bold = BOLD_RE.replace_all(&linked, "<strong>$1</strong>");
    let italic = ITALIC_RE.replace_all(&bold, "<em>$1</em>");
    italic.into_owned()
}

/// Allow only http:, https:, mailto:, or schemeless/relative/fragment
/// targets; anything else becomes a harmless placeholder.
fn safe_href(url: &str) -> String {
    let trimmed = url.trim();
    let lower = trimmed.to_ascii_lowercase();
    let authority_end = lower
        .find(|c| c == '/' || c == '?' || c == '#')
        .unwrap_or(lower.len());
    let allowed = match lower[..authority_end].find(':') {
        Some(colon) => matches!(&lower[..colon], "http" | "https" | "mailto"),
        None => true,
    };
    if allowed {
        trimmed.to_string()
    } else {
        "#".to_string()
    }
}
