//! Caddyfile generation and parsing
//!
//! Each managed server owns a single-site Caddyfile:
//!
//! ```text
//! # serve-id: blog
//! localhost:8080 {
//! 	root "/srv/blog"
//! 	log "/data/blog/access.log"
//! 	errors "/data/blog/error.log"
//! }
//! ```
//!
//! The parser is deliberately forgiving so that hand-edited files keep
//! loading: comments, unknown directives, nested blocks, additional sites and
//! the braceless single-site form are all accepted. Only the first site block
//! contributes to the resulting [`ServerDefinition`].

use crate::error::{Result, ServeError};
use crate::server::{validate_id, ServerDefinition};
use std::path::{Path, PathBuf};
use tracing::trace;

/// Comment prefix carrying the server id
pub const ID_MARKER: &str = "# serve-id:";

/// Host used in generated site labels
pub const DEFAULT_HOST: &str = "localhost";

/// Port Caddy binds when a site label has none
pub const DEFAULT_SITE_PORT: u16 = 2015;

/// One `host:port` site label
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    /// Host part, may be empty (`:8080`)
    pub host: String,
    /// Port part, `None` when the label has no port
    pub port: Option<u16>,
}

/// A single significant line inside a Caddyfile
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    /// `name arguments...`
    Directive { name: String, arguments: String },
    /// `name arguments... {`, opening a nested block
    Block { name: String, arguments: String },
    /// `}`
    End,
}

/// Arguments of a `root` directive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootArguments {
    pub path: PathBuf,
}

/// Log destinations written into a generated Caddyfile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPaths {
    pub access: PathBuf,
    pub error: PathBuf,
}

/// Render a Caddyfile without log directives
pub fn render(definition: &ServerDefinition) -> Result<String> {
    render_document(definition, None)
}

/// Render a Caddyfile with `log` and `errors` directives
pub fn render_with_logs(definition: &ServerDefinition, logs: &LogPaths) -> Result<String> {
    render_document(definition, Some(logs))
}

fn render_document(definition: &ServerDefinition, logs: Option<&LogPaths>) -> Result<String> {
    definition.validate()?;

    let mut out = String::new();
    out.push_str(&format!("{} {}\n", ID_MARKER, definition.id));
    out.push_str(&format!("{}:{} {{\n", DEFAULT_HOST, definition.port));
    out.push_str(&format!("\troot {}\n", quote_path(&definition.root)?));

    if let Some(logs) = logs {
        out.push_str(&format!("\tlog {}\n", quote_path(&logs.access)?));
        out.push_str(&format!("\terrors {}\n", quote_path(&logs.error)?));
    }

    out.push_str("}\n");
    Ok(out)
}

fn quote_path(path: &Path) -> Result<String> {
    let text = path.to_str().ok_or_else(|| {
        ServeError::InvalidDefinition(format!("path {:?} is not valid UTF-8", path))
    })?;

    if text.contains(['"', '\\', '{', '}', '\n', '\r']) {
        return Err(ServeError::InvalidDefinition(format!(
            "path '{}' cannot be written to a Caddyfile",
            text.escape_debug()
        )));
    }

    Ok(format!("\"{}\"", text))
}

/// Cut a trailing `# comment`, ignoring `#` inside quotes or glued to a token
fn strip_comment(line: &str) -> &str {
    let mut in_quotes = false;
    let mut after_space = true;

    for (i, c) in line.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '#' if !in_quotes && after_space => return &line[..i],
            _ => {}
        }
        after_space = c.is_whitespace();
    }

    line
}

/// Split a site header into its labels
///
/// Labels may be separated by commas, whitespace or both. Blank and comment
/// lines produce no labels.
pub fn parse_label_list(line: &str) -> Result<Vec<Label>> {
    let line = strip_comment(line).trim();
    let line = line.strip_suffix('{').unwrap_or(line);

    line.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|token| !token.is_empty())
        .map(parse_label)
        .collect()
}

/// Split one label into host and port
pub fn parse_label(label: &str) -> Result<Label> {
    let malformed = |reason: &str| ServeError::MalformedLabel {
        label: label.to_string(),
        reason: reason.to_string(),
    };

    let token = label.trim();
    let address = token
        .strip_prefix("http://")
        .or_else(|| token.strip_prefix("https://"))
        .unwrap_or(token);
    // A label may carry a path (`example.com/api`)
    let address = address.split('/').next().unwrap_or_default();

    if address.is_empty() {
        return Err(malformed("label is empty"));
    }

    let (host, port) = if let Some(bracketed) = address.strip_prefix('[') {
        let (host, tail) = bracketed
            .split_once(']')
            .ok_or_else(|| malformed("unterminated IPv6 host"))?;
        if tail.is_empty() {
            (host, None)
        } else {
            let port = tail
                .strip_prefix(':')
                .ok_or_else(|| malformed("unexpected text after IPv6 host"))?;
            (host, Some(port))
        }
    } else {
        match address.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (address, None),
        }
    };

    let port = match port {
        None => None,
        Some("") => return Err(malformed("port is empty")),
        Some(text) if !text.chars().all(|c| c.is_ascii_digit()) => {
            return Err(malformed("port is not numeric"))
        }
        Some(text) => Some(
            text.parse::<u16>()
                .map_err(|_| malformed("port is out of range"))?,
        ),
    };

    Ok(Label {
        host: host.to_string(),
        port,
    })
}

/// Classify one line; blank and comment lines yield `None`
pub fn parse_entry(line: &str) -> Option<Entry> {
    let line = strip_comment(line).trim();
    if line.is_empty() {
        return None;
    }
    if line == "}" {
        return Some(Entry::End);
    }

    let (body, opens_block) = match line.strip_suffix('{') {
        Some(body) => (body.trim_end(), true),
        None => (line, false),
    };

    let (name, arguments) = match body.split_once(char::is_whitespace) {
        Some((name, arguments)) => (name.to_string(), arguments.trim().to_string()),
        None => (body.to_string(), String::new()),
    };

    Some(if opens_block {
        Entry::Block { name, arguments }
    } else {
        Entry::Directive { name, arguments }
    })
}

/// Extract the path from a `root` directive's arguments
///
/// Errors carry line 0; [`parse`] fills in the real line.
pub fn parse_root_arguments(arguments: &str) -> Result<RootArguments> {
    let arguments = arguments.trim();

    let path = if let Some(quoted) = arguments.strip_prefix('"') {
        let end = quoted
            .find('"')
            .ok_or_else(|| ServeError::parse(0, "unterminated quote in root"))?;
        &quoted[..end]
    } else {
        arguments.split_whitespace().next().unwrap_or_default()
    };

    if path.is_empty() {
        return Err(ServeError::parse(0, "root directive has no path"));
    }

    Ok(RootArguments {
        path: PathBuf::from(path),
    })
}

/// Find the id carried by the `# serve-id:` marker
pub fn find_id(text: &str) -> Option<&str> {
    text.lines()
        .filter_map(|line| line.trim().strip_prefix(ID_MARKER))
        .map(str::trim)
        .find(|id| !id.is_empty())
}

/// Parse a Caddyfile, taking the id from its marker comment
pub fn parse(text: &str) -> Result<ServerDefinition> {
    let id = find_id(text).ok_or_else(|| ServeError::parse(1, "missing server id marker"))?;
    validate_id(id).map_err(|e| ServeError::parse(1, e.to_string()))?;
    parse_with_id(id, text)
}

/// Parse a Caddyfile for a known id, ignoring any marker comment
pub fn parse_with_id(id: &str, text: &str) -> Result<ServerDefinition> {
    let mut labels: Vec<Label> = Vec::new();
    let mut root: Option<PathBuf> = None;
    let mut sites = 0usize;
    let mut depth = 0usize;
    // depth at which the current site's own directives live
    let mut site_depth = 1usize;
    let mut awaiting_brace = false;
    let mut braceless = false;
    let mut last_line = 0usize;

    for (index, raw) in text.lines().enumerate() {
        let line = index + 1;
        last_line = line;

        let Some(entry) = parse_entry(raw) else {
            continue;
        };

        if depth == 0 && !braceless {
            match entry {
                Entry::End => return Err(ServeError::parse(line, "unexpected '}'")),
                Entry::Block { ref name, .. } if name.is_empty() => {
                    if !awaiting_brace {
                        return Err(ServeError::parse(line, "block opened without a site label"));
                    }
                    awaiting_brace = false;
                    depth = 1;
                }
                _ if awaiting_brace => {
                    if sites > 1 {
                        return Err(ServeError::parse(line, "only a single site may omit braces"));
                    }
                    awaiting_brace = false;
                    braceless = true;
                    site_depth = 0;
                    apply_site_entry(entry, line, sites, depth, site_depth, &mut root)?;
                }
                Entry::Block { .. } => {
                    sites += 1;
                    let site_labels = parse_label_list(raw)?;
                    if sites == 1 {
                        labels = site_labels;
                    }
                    depth = 1;
                }
                Entry::Directive { .. } => {
                    sites += 1;
                    let site_labels = parse_label_list(raw)?;
                    if sites == 1 {
                        labels = site_labels;
                    }
                    awaiting_brace = true;
                }
            }
            continue;
        }

        match entry {
            Entry::End => {
                if depth == 0 {
                    return Err(ServeError::parse(line, "unexpected '}'"));
                }
                depth -= 1;
            }
            Entry::Block { ref name, .. } => {
                trace!(block = %name, line, "Skipping nested block");
                depth += 1;
            }
            Entry::Directive { .. } => {
                apply_site_entry(entry, line, sites, depth, site_depth, &mut root)?;
            }
        }
    }

    if depth != 0 {
        return Err(ServeError::parse(last_line, "unclosed block"));
    }
    if sites == 0 {
        return Err(ServeError::parse(last_line.max(1), "no site block found"));
    }

    let root = root.ok_or_else(|| ServeError::parse(last_line, "missing root directive"))?;
    let port = labels
        .iter()
        .find_map(|label| label.port)
        .unwrap_or(DEFAULT_SITE_PORT);

    if port == 0 {
        return Err(ServeError::parse(1, "site port must be greater than 0"));
    }

    Ok(ServerDefinition::with_id(id, root, port))
}

fn apply_site_entry(
    entry: Entry,
    line: usize,
    sites: usize,
    depth: usize,
    site_depth: usize,
    root: &mut Option<PathBuf>,
) -> Result<()> {
    let Entry::Directive { name, arguments } = entry else {
        return Ok(());
    };

    if sites != 1 || depth != site_depth || root.is_some() {
        return Ok(());
    }

    if name == "root" {
        let parsed = parse_root_arguments(&arguments).map_err(|e| match e {
            ServeError::Parse { message, .. } => ServeError::parse(line, message),
            other => other,
        })?;
        *root = Some(parsed.path);
    } else {
        trace!(directive = %name, line, "Ignoring directive");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blog() -> ServerDefinition {
        ServerDefinition::with_id("blog", "/srv/blog", 8080)
    }

    #[test]
    fn test_render_format() {
        let text = render(&blog()).unwrap();
        assert_eq!(
            text,
            "# serve-id: blog\nlocalhost:8080 {\n\troot \"/srv/blog\"\n}\n"
        );
    }

    #[test]
    fn test_render_with_logs() {
        let logs = LogPaths {
            access: PathBuf::from("/data/blog/access.log"),
            error: PathBuf::from("/data/blog/error.log"),
        };
        let text = render_with_logs(&blog(), &logs).unwrap();

        assert!(text.contains("\tlog \"/data/blog/access.log\"\n"));
        assert!(text.contains("\terrors \"/data/blog/error.log\"\n"));
        assert_eq!(text, render_with_logs(&blog(), &logs).unwrap());
    }

    #[test]
    fn test_render_rejects_grammar_breaking_input() {
        let def = ServerDefinition::with_id("blog", "/srv/bl}og", 8080);
        assert!(matches!(render(&def), Err(ServeError::InvalidDefinition(_))));

        // A trailing backslash would escape the closing quote
        let def = ServerDefinition::with_id("blog", "/srv/blog\\", 8080);
        assert!(matches!(render(&def), Err(ServeError::InvalidDefinition(_))));

        let logs = LogPaths {
            access: PathBuf::from("/logs/\"access\".log"),
            error: PathBuf::from("/logs/error.log"),
        };
        assert!(matches!(
            render_with_logs(&blog(), &logs),
            Err(ServeError::InvalidDefinition(_))
        ));
    }

    #[test]
    fn test_round_trip() {
        let definitions = [
            blog(),
            ServerDefinition::with_id("docs", "/home/me/My Site", 1),
            ServerDefinition::with_id("x-1", "/", 65535),
            ServerDefinition::with_id("hash", "/srv/#tag", 3000),
            ServerDefinition::new("/var/www", 4000),
        ];

        for def in definitions {
            let text = render(&def).unwrap();
            assert_eq!(parse(&text).unwrap(), def, "round trip of {}", text);
        }
    }

    #[test]
    fn test_parse_label_list() {
        let labels = parse_label_list("localhost:8080, example.com:8080").unwrap();
        assert_eq!(
            labels,
            vec![
                Label { host: "localhost".to_string(), port: Some(8080) },
                Label { host: "example.com".to_string(), port: Some(8080) },
            ]
        );

        let labels = parse_label_list("  a:1   b:2,c:3 {").unwrap();
        assert_eq!(labels.len(), 3);
        assert_eq!(labels[2].port, Some(3));

        assert!(parse_label_list("").unwrap().is_empty());
        assert!(parse_label_list("   ").unwrap().is_empty());
        assert!(parse_label_list("# localhost:80").unwrap().is_empty());
    }

    #[test]
    fn test_parse_label() {
        assert_eq!(
            parse_label("localhost:8080").unwrap(),
            Label { host: "localhost".to_string(), port: Some(8080) }
        );
        assert_eq!(
            parse_label("example.com").unwrap(),
            Label { host: "example.com".to_string(), port: None }
        );
        assert_eq!(
            parse_label(":2015").unwrap(),
            Label { host: String::new(), port: Some(2015) }
        );
        assert_eq!(
            parse_label("https://example.com:8443/api").unwrap(),
            Label { host: "example.com".to_string(), port: Some(8443) }
        );
        assert_eq!(
            parse_label("[::1]:9000").unwrap(),
            Label { host: "::1".to_string(), port: Some(9000) }
        );
    }

    #[test]
    fn test_parse_label_malformed() {
        for label in ["localhost:http", "localhost:", "localhost:99999", "[::1", "http://"] {
            assert!(
                matches!(parse_label(label), Err(ServeError::MalformedLabel { .. })),
                "label {:?} should be malformed",
                label
            );
        }
        assert!(parse_label_list("a:1, b:x").is_err());
    }

    #[test]
    fn test_parse_entry() {
        assert_eq!(
            parse_entry("\troot \"/srv/blog\""),
            Some(Entry::Directive {
                name: "root".to_string(),
                arguments: "\"/srv/blog\"".to_string()
            })
        );
        assert_eq!(
            parse_entry("  gzip"),
            Some(Entry::Directive { name: "gzip".to_string(), arguments: String::new() })
        );
        assert_eq!(
            parse_entry("proxy /api localhost:9000 {"),
            Some(Entry::Block {
                name: "proxy".to_string(),
                arguments: "/api localhost:9000".to_string()
            })
        );
        assert_eq!(parse_entry("  }  "), Some(Entry::End));
        assert_eq!(parse_entry(""), None);
        assert_eq!(parse_entry("   # just a comment"), None);
        assert_eq!(
            parse_entry("browse # list directories"),
            Some(Entry::Directive { name: "browse".to_string(), arguments: String::new() })
        );
    }

    #[test]
    fn test_parse_root_arguments() {
        assert_eq!(
            parse_root_arguments(" \"/srv/my site\" ").unwrap().path,
            PathBuf::from("/srv/my site")
        );
        assert_eq!(
            parse_root_arguments("/srv/blog").unwrap().path,
            PathBuf::from("/srv/blog")
        );
        assert!(parse_root_arguments("").is_err());
        assert!(parse_root_arguments("\"/srv/open").is_err());
        assert!(parse_root_arguments("\"\"").is_err());
    }

    #[test]
    fn test_parse_tolerates_hand_edits() {
        let text = r#"
# serve-id: blog
# edited by hand
localhost:8080, 127.0.0.1:8080 {
    gzip
    root /srv/blog   # content lives here
    proxy /api localhost:9000 {
        root /not/this/one
        transparent
    }
    browse
}

other.local:9090 {
    root /srv/other
}
"#;
        assert_eq!(parse(text).unwrap(), blog());
    }

    #[test]
    fn test_parse_braceless_site() {
        let text = "localhost:8080\nroot /srv/blog\nlog stdout\n";
        assert_eq!(parse_with_id("blog", text).unwrap(), blog());
    }

    #[test]
    fn test_parse_brace_on_next_line() {
        let text = "localhost:8080\n{\n  root /srv/blog\n}\n";
        assert_eq!(parse_with_id("blog", text).unwrap(), blog());
    }

    #[test]
    fn test_parse_default_port() {
        let text = "example.com {\n root /srv/blog\n}\n";
        assert_eq!(parse_with_id("blog", text).unwrap().port, DEFAULT_SITE_PORT);
    }

    #[test]
    fn test_parse_with_id_overrides_marker() {
        let text = render(&blog()).unwrap();
        let def = parse_with_id("renamed", &text).unwrap();
        assert_eq!(def.id, "renamed");
        assert_eq!(def.port, 8080);
    }

    #[test]
    fn test_parse_errors() {
        let missing_marker = "localhost:8080 {\n root /srv/blog\n}\n";
        assert!(matches!(parse(missing_marker), Err(ServeError::Parse { line: 1, .. })));

        let unclosed = "# serve-id: blog\nlocalhost:8080 {\n root /srv/blog\n";
        assert!(parse(unclosed).unwrap_err().to_string().contains("unclosed block"));

        let stray = "# serve-id: blog\n}\n";
        assert!(matches!(parse(stray), Err(ServeError::Parse { line: 2, .. })));

        let no_root = "# serve-id: blog\nlocalhost:8080 {\n gzip\n}\n";
        assert!(parse(no_root).unwrap_err().to_string().contains("missing root"));

        let empty_root = "# serve-id: blog\nlocalhost:8080 {\n root\n}\n";
        assert!(matches!(parse(empty_root), Err(ServeError::Parse { line: 3, .. })));

        let empty = "# serve-id: blog\n";
        assert!(parse(empty).unwrap_err().to_string().contains("no site block"));

        let bad_label = "# serve-id: blog\nlocalhost:web {\n root /srv\n}\n";
        assert!(matches!(parse(bad_label), Err(ServeError::MalformedLabel { .. })));
    }
}
