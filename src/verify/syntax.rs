//! Parse checks that never execute the file.
//!
//! Data formats (JSON, YAML, TOML) go through their real parsers. Source
//! files in C-family languages get a delimiter-balance scan that skips
//! strings, character literals and comments. That catches truncated output
//! and unbalanced edits without a compiler.

use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Checker {
    Json,
    Yaml,
    Toml,
    Delimiters { single_quote_strings: bool },
}

fn checker_for(path: &Path) -> Option<Checker> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    match ext.as_str() {
        "json" => Some(Checker::Json),
        "yaml" | "yml" => Some(Checker::Yaml),
        "toml" => Some(Checker::Toml),
        "js" | "jsx" | "ts" | "tsx" | "mjs" | "cjs" => Some(Checker::Delimiters {
            single_quote_strings: true,
        }),
        "rs" | "go" | "java" | "c" | "h" | "cpp" | "hpp" | "cc" | "cs" | "kt" | "swift" => {
            Some(Checker::Delimiters {
                single_quote_strings: false,
            })
        }
        _ => None,
    }
}

/// Whether the file has a format this module knows how to check.
pub fn is_checkable(path: &Path) -> bool {
    checker_for(path).is_some()
}

/// Check `content` as the format implied by `path`. Unrecognized formats
/// pass.
pub fn check_content(path: &Path, content: &str) -> Result<(), String> {
    match checker_for(path) {
        None => Ok(()),
        Some(Checker::Json) => serde_json::from_str::<serde_json::Value>(content)
            .map(|_| ())
            .map_err(|e| e.to_string()),
        Some(Checker::Yaml) => serde_yaml::from_str::<serde_yaml::Value>(content)
            .map(|_| ())
            .map_err(|e| e.to_string()),
        Some(Checker::Toml) => toml::from_str::<toml::Table>(content)
            .map(|_| ())
            .map_err(|e| e.to_string().trim().to_string()),
        Some(Checker::Delimiters {
            single_quote_strings,
        }) => check_delimiters(content, single_quote_strings),
    }
}

/// Read and check a file. Read failures are reported as check failures.
pub fn check_file(path: &Path) -> Result<(), String> {
    if !is_checkable(path) {
        return Ok(());
    }
    let content = std::fs::read_to_string(path).map_err(|e| format!("unreadable: {}", e))?;
    check_content(path, &content)
}

fn closing_for(open: char) -> char {
    match open {
        '(' => ')',
        '[' => ']',
        _ => '}',
    }
}

fn check_delimiters(content: &str, single_quote_strings: bool) -> Result<(), String> {
    let chars: Vec<char> = content.chars().collect();
    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut line = 1;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            '\n' => line += 1,
            '/' if next == Some('/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '/' if next == Some('*') => {
                let start = line;
                i += 2;
                loop {
                    match chars.get(i) {
                        None => return Err(format!("unterminated block comment starting at line {}", start)),
                        Some('*') if chars.get(i + 1) == Some(&'/') => {
                            i += 2;
                            break;
                        }
                        Some('\n') => line += 1,
                        _ => {}
                    }
                    i += 1;
                }
                continue;
            }
            '"' | '`' => {
                i = skip_string(&chars, i, c, &mut line)?;
                continue;
            }
            '\'' if single_quote_strings => {
                i = skip_string(&chars, i, c, &mut line)?;
                continue;
            }
            '\'' => {
                // Char literal ('x', '\n', '\u{1F600}') or a Rust lifetime.
                if next == Some('\\') {
                    let mut j = i + 2;
                    while j < chars.len() && chars[j] != '\'' && chars[j] != '\n' {
                        j += 1;
                    }
                    i = j + 1;
                    continue;
                }
                if chars.get(i + 2) == Some(&'\'') {
                    i += 3;
                    continue;
                }
            }
            '(' | '[' | '{' => stack.push((c, line)),
            ')' | ']' | '}' => match stack.pop() {
                Some((open, _)) if closing_for(open) == c => {}
                Some((open, open_line)) => {
                    return Err(format!(
                        "mismatched '{}' at line {} (expected '{}' to close line {})",
                        c,
                        line,
                        closing_for(open),
                        open_line
                    ));
                }
                None => return Err(format!("unexpected '{}' at line {}", c, line)),
            },
            _ => {}
        }
        i += 1;
    }

    match stack.pop() {
        Some((open, open_line)) => Err(format!("unclosed '{}' opened at line {}", open, open_line)),
        None => Ok(()),
    }
}

/// Skip a quoted string starting at `start`; returns the index after the
/// closing quote.
fn skip_string(chars: &[char], start: usize, quote: char, line: &mut usize) -> Result<usize, String> {
    let start_line = *line;
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' if quote != '`' => i += 1,
            '\n' => *line += 1,
            c if c == quote => return Ok(i + 1),
            _ => {}
        }
        i += 1;
    }
    Err(format!("unterminated string starting at line {}", start_line))
}
