//! Syntax-aware mutant generator for Rust source files.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tree_sitter::{Node, Parser, Tree};

use crate::mutation::config::MutationOperator;
use crate::mutation::engine::{EngineError, MutatedMember, Mutant, MutationGenerator};
use crate::mutation::model::UnitId;

fn replacements(token: &str, operator: MutationOperator) -> &'static [&'static str] {
    use MutationOperator::*;
    match (operator, token) {
        (Arithmetic, "+") => &["-"],
        (Arithmetic, "-") => &["+"],
        (Arithmetic, "*") => &["/"],
        (Arithmetic, "/") => &["*"],
        (Arithmetic, "%") => &["*"],
        (ConditionalsBoundary, "<") => &["<="],
        (ConditionalsBoundary, "<=") => &["<"],
        (ConditionalsBoundary, ">") => &[">="],
        (ConditionalsBoundary, ">=") => &[">"],
        (NegateConditionals, "==") => &["!="],
        (NegateConditionals, "!=") => &["=="],
        (NegateConditionals, "<") => &[">="],
        (NegateConditionals, "<=") => &[">"],
        (NegateConditionals, ">") => &["<="],
        (NegateConditionals, ">=") => &["<"],
        (BooleanLiterals, "true") => &["false"],
        (BooleanLiterals, "false") => &["true"],
        (LogicalConnectives, "&&") => &["||"],
        (LogicalConnectives, "||") => &["&&"],
        _ => &[],
    }
}

/// One mutation point in a source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationSite {
    /// Byte offset of the original token.
    pub start: usize,
    /// Byte offset past the original token.
    pub end: usize,
    /// One-based line.
    pub line: usize,
    /// Operator family.
    pub operator: MutationOperator,
    /// Original token.
    pub original: String,
    /// Replacement token.
    pub replacement: &'static str,
    /// Item the token belongs to.
    pub member: MutatedMember,
}

fn parse(source: &str) -> Result<Tree, EngineError> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_rust::LANGUAGE.into())
        .map_err(|err| EngineError::Parse(err.to_string()))?;
    parser
        .parse(source, None)
        .ok_or_else(|| EngineError::Parse("parser returned no tree".to_string()))
}

fn node_text<'a>(node: Node, source: &'a str) -> &'a str {
    &source[node.start_byte()..node.end_byte()]
}

/// Mutation points of `source` for the enabled `operators`, in source order.
///
/// Only operator tokens of binary expressions and boolean literals are candidates, so closure
/// bars, trait-bound `+` and anything inside comments or literals are never touched.
pub fn scan_sites(
    source: &str,
    operators: &BTreeSet<MutationOperator>,
) -> Result<Vec<MutationSite>, EngineError> {
    let tree = parse(source)?;
    let mut sites = Vec::new();
    collect_sites(tree.root_node(), source, operators, &mut sites);
    sites.sort_by_key(|site| site.start);
    Ok(sites)
}

fn collect_sites(
    node: Node,
    source: &str,
    operators: &BTreeSet<MutationOperator>,
    sites: &mut Vec<MutationSite>,
) {
    let token = match node.kind() {
        "binary_expression" => node.child_by_field_name("operator"),
        "boolean_literal" => Some(node),
        _ => None,
    };
    if let Some(token) = token {
        let original = node_text(token, source);
        let mut member = None;
        for &operator in operators {
            for replacement in replacements(original, operator).iter().copied() {
                let member = member.get_or_insert_with(|| enclosing_member(node, source));
                sites.push(MutationSite {
                    start: token.start_byte(),
                    end: token.end_byte(),
                    line: token.start_position().row + 1,
                    operator,
                    original: original.to_string(),
                    replacement,
                    member: member.clone(),
                });
            }
        }
    }

    let count = node.child_count();
    for i in 0..count {
        if let Some(child) = node.child(i) {
            collect_sites(child, source, operators, sites);
        }
    }
}

/// Nearest enclosing `fn`, `static` or `const` item of `node`.
fn enclosing_member(node: Node, source: &str) -> MutatedMember {
    let mut current = node.parent();
    while let Some(item) = current {
        let name = item.child_by_field_name("name").map(|n| node_text(n, source));
        match (item.kind(), name) {
            ("function_item", Some(name)) => {
                let mut signature = name.to_string();
                for field in ["type_parameters", "parameters"] {
                    if let Some(part) = item.child_by_field_name(field) {
                        signature.push_str(node_text(part, source));
                    }
                }
                if let Some(ret) = item.child_by_field_name("return_type") {
                    signature.push_str(" -> ");
                    signature.push_str(node_text(ret, source));
                }
                return MutatedMember::method(signature);
            }
            ("static_item", Some(name)) => {
                return MutatedMember::static_initializer(format!("static {name}"));
            }
            ("const_item", Some(name)) => return MutatedMember::method(format!("const {name}")),
            _ => current = item.parent(),
        }
    }
    MutatedMember::method("<module>")
}

#[derive(Debug)]
struct ScannedUnit {
    source: String,
    sites: Vec<MutationSite>,
}

/// Generator over files beneath a project root. Unit ids are paths relative to the root.
#[derive(Debug)]
pub struct SourceMutator {
    root: PathBuf,
    operators: BTreeSet<MutationOperator>,
    scanned: Mutex<BTreeMap<UnitId, Arc<ScannedUnit>>>,
}

impl SourceMutator {
    /// Generator for `operators` over files under `root`.
    pub fn new(root: impl Into<PathBuf>, operators: BTreeSet<MutationOperator>) -> Self {
        Self {
            root: root.into(),
            operators,
            scanned: Mutex::new(BTreeMap::new()),
        }
    }

    /// Mutation points of `unit`.
    pub fn sites(&self, unit: &UnitId) -> Result<Vec<MutationSite>, EngineError> {
        Ok(self.scan(unit)?.sites.clone())
    }

    fn scan(&self, unit: &UnitId) -> Result<Arc<ScannedUnit>, EngineError> {
        if let Some(scanned) = self
            .scanned
            .lock()
            .ok()
            .and_then(|cache| cache.get(unit).cloned())
        {
            return Ok(scanned);
        }

        let source = std::fs::read_to_string(self.root.join(unit.as_str()))
            .map_err(|_| EngineError::UnknownUnit(unit.to_string()))?;
        let sites = scan_sites(&source, &self.operators)?;
        let scanned = Arc::new(ScannedUnit { source, sites });
        if let Ok(mut cache) = self.scanned.lock() {
            cache.insert(unit.clone(), Arc::clone(&scanned));
        }
        Ok(scanned)
    }
}

impl MutationGenerator for SourceMutator {
    fn count_mutation_points(&self, unit: &UnitId) -> Result<usize, EngineError> {
        Ok(self.scan(unit)?.sites.len())
    }

    fn mutant_for(&self, unit: &UnitId, index: usize) -> Result<Mutant, EngineError> {
        let scanned = self.scan(unit)?;
        let site = scanned
            .sites
            .get(index)
            .ok_or_else(|| EngineError::IndexOutOfRange {
                unit: unit.to_string(),
                index,
                total: scanned.sites.len(),
            })?;

        let mut code = String::with_capacity(scanned.source.len() + site.replacement.len());
        code.push_str(&scanned.source[..site.start]);
        code.push_str(site.replacement);
        code.push_str(&scanned.source[site.end..]);

        let source_file = std::path::Path::new(unit.as_str())
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| unit.to_string());

        Ok(Mutant {
            index,
            code: code.into_bytes(),
            member: site.member.clone(),
            description: format!(
                "line {}: replaced `{}` with `{}` ({})",
                site.line, site.original, site.replacement, site.operator
            ),
            unit_name: unit.to_string(),
            source_file,
        })
    }
}
