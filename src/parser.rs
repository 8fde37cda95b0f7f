use crate::error::TplError;
use crate::path::PathResolver;
use crate::tokenizer::{self, FilterCall, Token};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Structured template node. Control nodes own their children so the
/// renderer can walk the tree with exhaustive matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    Text(String),
    Var {
        expr: String,
        filters: Vec<FilterCall>,
    },
    If {
        cond: String,
        body: Vec<Node>,
        else_body: Vec<Node>,
    },
    For {
        item: String,
        iterable: String,
        body: Vec<Node>,
    },
    Block {
        name: String,
        body: Vec<Node>,
    },
    Extends {
        parent: String,
    },
    Include {
        name: String,
    },
}

/// Compiled, cacheable form of one template file: node tree, extracted
/// blocks, parent reference and the dependency set that gates cache
/// validity. Immutable once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedTemplate {
    pub nodes: Vec<Node>,
    pub template_path: String,
    pub parent: Option<String>,
    pub blocks: BTreeMap<String, Vec<Node>>,
    pub dependencies: BTreeSet<String>,
}

enum TagFrame {
    If {
        cond: String,
        offset: usize,
        body: Option<Vec<Node>>,
    },
    For {
        item: String,
        iterable: String,
        offset: usize,
    },
    Block {
        name: String,
        offset: usize,
    },
}

impl TagFrame {
    fn command(&self) -> &'static str {
        match self {
            TagFrame::If { .. } => "if",
            TagFrame::For { .. } => "for",
            TagFrame::Block { .. } => "block",
        }
    }

    fn offset(&self) -> usize {
        match self {
            TagFrame::If { offset, .. } => *offset,
            TagFrame::For { offset, .. } => *offset,
            TagFrame::Block { offset, .. } => *offset,
        }
    }
}

/// Groups a flat token stream into a node tree. Every opening command must
/// have its matching close; a stray close or an unclosed frame at end of
/// input is a parse error naming the command and its byte offset.
pub fn group_tokens(tokens: Vec<Token>, template: &str) -> Result<Vec<Node>, TplError> {
    let mut nodes_stack: Vec<Vec<Node>> = vec![Vec::new()];
    let mut tag_stack: Vec<TagFrame> = Vec::new();

    for token in tokens {
        match token {
            Token::Text(t) => current(&mut nodes_stack).push(Node::Text(t)),
            Token::Var { expr, filters, .. } => {
                current(&mut nodes_stack).push(Node::Var { expr, filters })
            }
            Token::Control {
                command,
                expr,
                offset,
            } => match command.as_str() {
                "if" => {
                    if expr.is_empty() {
                        return Err(TplError::parse(template, offset, "'if' without condition"));
                    }
                    tag_stack.push(TagFrame::If {
                        cond: expr,
                        offset,
                        body: None,
                    });
                    nodes_stack.push(Vec::new());
                }
                "else" => match tag_stack.last_mut() {
                    Some(TagFrame::If { body, .. }) if body.is_none() => {
                        let accumulated = nodes_stack.pop().unwrap_or_default();
                        *body = Some(accumulated);
                        nodes_stack.push(Vec::new());
                    }
                    _ => {
                        return Err(TplError::parse(
                            template,
                            offset,
                            "'else' outside of an 'if' block",
                        ));
                    }
                },
                "endif" => match tag_stack.pop() {
                    Some(TagFrame::If { cond, body, .. }) => {
                        let accumulated = nodes_stack.pop().unwrap_or_default();
                        let (body, else_body) = match body {
                            Some(b) => (b, accumulated),
                            None => (accumulated, Vec::new()),
                        };
                        current(&mut nodes_stack).push(Node::If {
                            cond,
                            body,
                            else_body,
                        });
                    }
                    other => return Err(unmatched_close(template, offset, "endif", other)),
                },
                "for" => {
                    let (item, iterable) = expr.split_once(" in ").ok_or_else(|| {
                        TplError::parse(
                            template,
                            offset,
                            "'for' expects '<item> in <collection>'",
                        )
                    })?;
                    tag_stack.push(TagFrame::For {
                        item: item.trim().to_string(),
                        iterable: iterable.trim().to_string(),
                        offset,
                    });
                    nodes_stack.push(Vec::new());
                }
                "endfor" => match tag_stack.pop() {
                    Some(TagFrame::For { item, iterable, .. }) => {
                        let body = nodes_stack.pop().unwrap_or_default();
                        current(&mut nodes_stack).push(Node::For {
                            item,
                            iterable,
                            body,
                        });
                    }
                    other => return Err(unmatched_close(template, offset, "endfor", other)),
                },
                "block" => {
                    if expr.is_empty() {
                        return Err(TplError::parse(template, offset, "'block' without a name"));
                    }
                    tag_stack.push(TagFrame::Block { name: expr, offset });
                    nodes_stack.push(Vec::new());
                }
                "endblock" => match tag_stack.pop() {
                    Some(TagFrame::Block { name, .. }) => {
                        let body = nodes_stack.pop().unwrap_or_default();
                        current(&mut nodes_stack).push(Node::Block { name, body });
                    }
                    other => return Err(unmatched_close(template, offset, "endblock", other)),
                },
                "extends" => current(&mut nodes_stack).push(Node::Extends {
                    parent: unquote(&expr).to_string(),
                }),
                "include" => current(&mut nodes_stack).push(Node::Include {
                    name: unquote(&expr).to_string(),
                }),
                other => {
                    return Err(TplError::parse(
                        template,
                        offset,
                        format!("unknown control command '{}'", other),
                    ));
                }
            },
        }
    }

    if let Some(frame) = tag_stack.last() {
        return Err(TplError::parse(
            template,
            frame.offset(),
            format!("unclosed '{}' block", frame.command()),
        ));
    }

    Ok(nodes_stack.pop().unwrap_or_default())
}

fn current(nodes_stack: &mut [Vec<Node>]) -> &mut Vec<Node> {
    nodes_stack
        .last_mut()
        .expect("grouping stack always holds the root frame")
}

fn unmatched_close(
    template: &str,
    offset: usize,
    close: &str,
    popped: Option<TagFrame>,
) -> TplError {
    let message = match popped {
        Some(frame) => format!("'{}' closes an open '{}' block", close, frame.command()),
        None => format!("'{}' with no matching open block", close),
    };
    TplError::parse(template, offset, message)
}

fn unquote(s: &str) -> &str {
    let s = s.trim();
    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')))
    {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

/// Parses a logical template name into a `ParsedTemplate`: resolve, read,
/// tokenize, group, then record the parent reference, the block map and the
/// dependency set (self + parent chain + resolved includes).
pub struct TemplateParser<'a> {
    resolver: &'a PathResolver,
}

impl<'a> TemplateParser<'a> {
    pub fn new(resolver: &'a PathResolver) -> Self {
        Self { resolver }
    }

    pub fn parse(&self, name: &str) -> Result<ParsedTemplate, TplError> {
        self.parse_chain(name, &mut Vec::new())
    }

    fn parse_chain(&self, name: &str, chain: &mut Vec<String>) -> Result<ParsedTemplate, TplError> {
        if chain.iter().any(|n| n == name) {
            return Err(TplError::parse(
                name,
                0,
                format!("circular 'extends' chain through '{}'", name),
            ));
        }
        chain.push(name.to_string());

        let path = self.resolver.resolve(name)?;
        let source = std::fs::read_to_string(&path)?;
        let tokens = tokenizer::tokenize(&source, name)?;
        let nodes = group_tokens(tokens, name)?;

        let template_path = path.to_string_lossy().into_owned();
        let mut dependencies = BTreeSet::new();
        dependencies.insert(template_path.clone());

        let parent = first_extends(&nodes);
        if let Some(parent_name) = &parent {
            // Parent files gate this template's cache validity too.
            let parent_tpl = self.parse_chain(parent_name, chain)?;
            dependencies.extend(parent_tpl.dependencies);
        }

        let mut blocks = BTreeMap::new();
        collect_blocks(&nodes, &mut blocks);

        for include_name in collect_includes(&nodes) {
            match self.resolver.resolve(&include_name) {
                Ok(p) => {
                    dependencies.insert(p.to_string_lossy().into_owned());
                }
                Err(_) => {
                    // Includes are rendered dynamically; a target missing at
                    // parse time surfaces at render time instead.
                    debug!(template = name, include = %include_name, "include target not resolvable at parse time");
                }
            }
        }

        chain.pop();
        Ok(ParsedTemplate {
            nodes,
            template_path,
            parent,
            blocks,
            dependencies,
        })
    }
}

fn first_extends(nodes: &[Node]) -> Option<String> {
    for node in nodes {
        match node {
            Node::Extends { parent } => return Some(parent.clone()),
            Node::If {
                body, else_body, ..
            } => {
                if let Some(p) = first_extends(body).or_else(|| first_extends(else_body)) {
                    return Some(p);
                }
            }
            Node::For { body, .. } | Node::Block { body, .. } => {
                if let Some(p) = first_extends(body) {
                    return Some(p);
                }
            }
            _ => {}
        }
    }
    None
}

/// Registers every block at any depth; a later registration for the same
/// name overrides the earlier one.
fn collect_blocks(nodes: &[Node], blocks: &mut BTreeMap<String, Vec<Node>>) {
    for node in nodes {
        match node {
            Node::Block { name, body } => {
                blocks.insert(name.clone(), body.clone());
                collect_blocks(body, blocks);
            }
            Node::If {
                body, else_body, ..
            } => {
                collect_blocks(body, blocks);
                collect_blocks(else_body, blocks);
            }
            Node::For { body, .. } => collect_blocks(body, blocks),
            _ => {}
        }
    }
}

fn collect_includes(nodes: &[Node]) -> Vec<String> {
    let mut out = Vec::new();
    fn walk(nodes: &[Node], out: &mut Vec<String>) {
        for node in nodes {
            match node {
                Node::Include { name } => out.push(name.clone()),
                Node::If {
                    body, else_body, ..
                } => {
                    walk(body, out);
                    walk(else_body, out);
                }
                Node::For { body, .. } | Node::Block { body, .. } => walk(body, out),
                _ => {}
            }
        }
    }
    walk(nodes, &mut out);
    out
}
