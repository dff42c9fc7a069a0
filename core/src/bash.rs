//! Shell AST façade over tree-sitter-bash.
//!
//! The token parsers never look at a raw command line; they walk the
//! concrete syntax tree and read two things from it: comments and
//! environment-variable assignments. Heredoc bodies, pipelines, `&&`/`||`
//! chains, and subshells are all covered because the walk visits every node
//! in the tree.
//!
//! The critical property lives in [`literal_word`]: a word that contains a
//! parameter expansion, command substitution, or arithmetic expansion
//! anywhere in it yields `None`. A token must appear literally in the
//! command text; it is never produced by shell expansion.

use tree_sitter::Node;
use tree_sitter::Parser;
use tree_sitter::Tree;
use tree_sitter_bash::LANGUAGE as BASH;

use crate::error::KlackErr;
use crate::error::Result;

/// Everything the token parsers need from a command, in source order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ParsedScript {
    pub assignments: Vec<Assignment>,
    /// Comment texts with the leading `#` stripped.
    pub comments: Vec<String>,
}

/// A `NAME=value` assignment, standalone or prefixing a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Assignment {
    pub name: String,
    /// `Some` only when the assigned word is purely literal; `None` when any
    /// part of it would be produced by shell expansion.
    pub value: Option<String>,
}

/// Parse `command` and collect its comments and assignments.
pub(crate) fn parse_script(command: &str) -> Result<ParsedScript> {
    let tree = parse_tree(command)?;
    let root = tree.root_node();
    if root.has_error() {
        return Err(KlackErr::ParseFailed(format!(
            "command is not valid shell: {command:?}"
        )));
    }

    let mut script = ParsedScript::default();
    collect(root, command, &mut script);
    Ok(script)
}

fn parse_tree(src: &str) -> Result<Tree> {
    let lang = BASH.into();
    let mut parser = Parser::new();
    parser
        .set_language(&lang)
        .map_err(|e| KlackErr::ParseFailed(format!("load bash grammar: {e}")))?;
    parser
        .parse(src, None)
        .ok_or_else(|| KlackErr::ParseFailed("bash parser produced no tree".to_string()))
}

fn collect(node: Node, src: &str, out: &mut ParsedScript) {
    match node.kind() {
        "comment" => {
            if let Ok(text) = node.utf8_text(src.as_bytes()) {
                let text = text.strip_prefix('#').unwrap_or(text);
                out.comments.push(text.to_string());
            }
        }
        "variable_assignment" => {
            let Some(name) = node
                .child_by_field_name("name")
                .and_then(|n| n.utf8_text(src.as_bytes()).ok())
            else {
                return;
            };
            let value = match node.child_by_field_name("value") {
                // `VAR=` assigns the empty string.
                None => Some(String::new()),
                Some(word) => literal_word(word, src),
            };
            out.assignments.push(Assignment {
                name: name.to_string(),
                value,
            });
            // Do not descend: a command substitution inside the assigned
            // value must not contribute comments or nested assignments.
        }
        _ => {
            let mut cursor = node.walk();
            for child in node.children(&mut cursor) {
                collect(child, src, out);
            }
        }
    }
}

/// If `node` is a word composed only of literal text, single-quoted
/// strings, and double-quoted strings whose parts are all plain content,
/// return the concatenated text; otherwise `None`.
fn literal_word(node: Node, src: &str) -> Option<String> {
    match node.kind() {
        "word" | "number" => Some(node.utf8_text(src.as_bytes()).ok()?.to_owned()),
        "raw_string" => {
            let raw = node.utf8_text(src.as_bytes()).ok()?;
            raw.strip_prefix('\'')
                .and_then(|s| s.strip_suffix('\''))
                .map(str::to_owned)
        }
        "string" => {
            let mut text = String::new();
            let mut cursor = node.walk();
            for child in node.named_children(&mut cursor) {
                match child.kind() {
                    "string_content" => text.push_str(child.utf8_text(src.as_bytes()).ok()?),
                    // Anything else means the string is *not* plain text.
                    _ => return None,
                }
            }
            Some(text)
        }
        "concatenation" => {
            let mut text = String::new();
            let mut cursor = node.walk();
            for child in node.named_children(&mut cursor) {
                text.push_str(&literal_word(child, src)?);
            }
            Some(text)
        }
        _ => None,
    }
}
