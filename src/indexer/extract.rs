//! Symbol extraction from C/C++ source using tree-sitter ASTs.
//!
//! Walks the AST of one file and collects:
//! - definitions (functions, methods, records, enums, enumerators,
//!   fields, globals, typedefs, namespaces, macros) with Clang-style USRs
//! - every identifier occurrence, to be resolved into references
//! - quoted `#include` targets
//! - syntax diagnostics (error and missing nodes)

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tree_sitter::{Node, Parser};

use crate::error::{IndexError, IndexResult};
use crate::storage::{Span, SymbolRow};

/// An identifier occurrence. `usr` is set when the occurrence names a
/// definition in this file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Occurrence {
    pub spelling: String,
    pub kind: &'static str,
    pub span: Span,
    pub usr: Option<String>,
}

/// A syntax problem reported by the parser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub line: usize,
    pub col: usize,
    pub message: String,
}

/// Everything extracted from one file.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub definitions: Vec<SymbolRow>,
    pub occurrences: Vec<Occurrence>,
    pub includes: Vec<String>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Parse `source` and extract its symbols. The bytes need not be valid UTF-8.
pub fn extract_source(path: &Path, source: impl AsRef<[u8]>) -> IndexResult<Extraction> {
    let source = source.as_ref();
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_cpp::LANGUAGE.into())
        .map_err(|e| IndexError::ParserInit(e.to_string()))?;

    let tree = parser
        .parse(source, None)
        .ok_or_else(|| IndexError::ParseFailed(path.to_path_buf()))?;

    let mut walker = Walker {
        source,
        scope: Vec::new(),
        namespaces: HashSet::new(),
        def_names: HashMap::new(),
        out: Extraction::default(),
    };
    walker.visit(&tree.root_node(), false);
    Ok(walker.out)
}

struct Walker<'s> {
    source: &'s [u8],
    /// USR scope components, e.g. `["@N@app", "@S@Widget"]`.
    scope: Vec<String>,
    namespaces: HashSet<String>,
    /// Start byte of a definition's name → its USR.
    def_names: HashMap<usize, String>,
    out: Extraction,
}

impl<'s> Walker<'s> {
    fn visit(&mut self, node: &Node, in_function: bool) {
        if node.is_error() {
            self.diagnostic(node, "syntax error".to_string());
        } else if node.is_missing() {
            self.diagnostic(node, format!("missing {}", node.kind()));
        }

        match node.kind() {
            "namespace_definition" => return self.visit_namespace(node, in_function),
            "class_specifier" | "struct_specifier" | "union_specifier" | "enum_specifier" => {
                if node.child_by_field_name("body").is_some() {
                    return self.visit_record(node, in_function);
                }
            }
            "function_definition" => return self.visit_function(node),
            "field_declaration" if !in_function => self.field_declaration(node),
            "declaration" if !in_function => self.global_declaration(node),
            "type_definition" => {
                for declarator in children_by_field(node, "declarator") {
                    if let Some(name) = declarator_name(&declarator) {
                        self.define(&name, "typedef", format!("@T@{}", self.text(&name)));
                    }
                }
            }
            "alias_declaration" => {
                if let Some(name) = node.child_by_field_name("name") {
                    self.define(&name, "typedef", format!("@T@{}", self.text(&name)));
                }
            }
            "preproc_def" | "preproc_function_def" => {
                if let Some(name) = node.child_by_field_name("name") {
                    let usr = format!("c:@macro@{}", self.text(&name));
                    self.define_absolute(&name, "macro", usr);
                }
            }
            "preproc_include" => {
                if let Some(path) = node.child_by_field_name("path") {
                    if path.kind() == "string_literal" {
                        let text = self.text(&path);
                        self.out.includes.push(text.trim_matches('"').to_string());
                    }
                }
                return;
            }
            "identifier" | "type_identifier" | "field_identifier" | "namespace_identifier" => {
                self.occurrence(node);
                return;
            }
            _ => {}
        }

        self.visit_children(node, in_function);
    }

    fn visit_children(&mut self, node: &Node, in_function: bool) {
        let mut cursor = node.walk();
        let children: Vec<Node> = node.children(&mut cursor).collect();
        for child in &children {
            self.visit(child, in_function);
        }
    }

    fn visit_namespace(&mut self, node: &Node, in_function: bool) {
        let component = match node.child_by_field_name("name") {
            Some(name) => {
                let text = self.text(&name);
                self.namespaces.insert(text.clone());
                let component = format!("@N@{text}");
                self.define(&name, "namespace", component.clone());
                component
            }
            None => "@aN".to_string(),
        };
        self.scope.push(component);
        self.visit_children(node, in_function);
        self.scope.pop();
    }

    fn visit_record(&mut self, node: &Node, in_function: bool) {
        let (tag, kind) = match node.kind() {
            "class_specifier" => ("S", "class"),
            "struct_specifier" => ("S", "struct"),
            "union_specifier" => ("U", "union"),
            _ => ("E", "enum"),
        };
        let component = match node.child_by_field_name("name") {
            Some(name) => {
                let text = self.text(&name);
                let component = format!("@{tag}@{text}");
                self.define(&name, kind, component.clone());
                component
            }
            None => format!("@{tag}@anon{}", node.start_byte()),
        };

        self.scope.push(component);
        if kind == "enum" {
            if let Some(body) = node.child_by_field_name("body") {
                let mut cursor = body.walk();
                let enumerators: Vec<Node> = body
                    .children(&mut cursor)
                    .filter(|c| c.kind() == "enumerator")
                    .collect();
                for enumerator in &enumerators {
                    if let Some(name) = enumerator.child_by_field_name("name") {
                        let text = self.text(&name);
                        self.define(&name, "enumerator", format!("@{text}"));
                    }
                }
            }
        }
        self.visit_children(node, in_function);
        self.scope.pop();
    }

    fn visit_function(&mut self, node: &Node) {
        let declarator = node
            .child_by_field_name("declarator")
            .and_then(|d| find_function_declarator(&d));

        if let Some(name_node) = declarator.and_then(|d| d.child_by_field_name("declarator")) {
            let (qualifiers, name) = self.split_qualified(&name_node);
            if let Some(name) = name {
                let qualifiers = qualifiers_as_components(&qualifiers, &self.namespaces);
                let in_record = self
                    .scope
                    .iter()
                    .chain(qualifiers.iter())
                    .any(|c| c.starts_with("@S@") || c.starts_with("@U@"));
                let kind = if in_record { "method" } else { "function" };
                let component = format!("{}@F@{}", qualifiers.concat(), self.text(&name));
                self.define(&name, kind, component);
            }
        }

        self.visit_children(node, true);
    }

    /// `a::b::f` → (["a", "b"], f). Destructors and operators keep their full text.
    fn split_qualified<'t>(&self, node: &Node<'t>) -> (Vec<String>, Option<Node<'t>>) {
        let mut qualifiers = Vec::new();
        let mut current = *node;
        while current.kind() == "qualified_identifier" {
            if let Some(scope) = current.child_by_field_name("scope") {
                qualifiers.push(self.text(&scope));
            }
            match current.child_by_field_name("name") {
                Some(name) => current = name,
                None => return (qualifiers, None),
            }
        }
        match current.kind() {
            "identifier" | "field_identifier" | "destructor_name" | "operator_name" => {
                (qualifiers, Some(current))
            }
            "template_function" => (qualifiers, current.child_by_field_name("name")),
            _ => (qualifiers, None),
        }
    }

    fn field_declaration(&mut self, node: &Node) {
        let in_record = self
            .scope
            .last()
            .map(|c| c.starts_with("@S@") || c.starts_with("@U@"))
            .unwrap_or(false);
        if !in_record {
            return;
        }
        for declarator in children_by_field(node, "declarator") {
            if let Some(name) = declarator_name(&declarator) {
                let text = self.text(&name);
                self.define(&name, "field", format!("@FI@{text}"));
            }
        }
    }

    fn global_declaration(&mut self, node: &Node) {
        for declarator in children_by_field(node, "declarator") {
            if let Some(name) = declarator_name(&declarator) {
                let text = self.text(&name);
                self.define(&name, "variable", format!("@{text}"));
            }
        }
    }

    /// Record a definition whose USR is the current scope plus `component`.
    fn define(&mut self, name: &Node, kind: &str, component: String) {
        let usr = format!("c:{}{}", self.scope.concat(), component);
        self.define_absolute(name, kind, usr);
    }

    fn define_absolute(&mut self, name: &Node, kind: &str, usr: String) {
        if self.def_names.contains_key(&name.start_byte()) {
            return;
        }
        self.def_names.insert(name.start_byte(), usr.clone());
        self.out.definitions.push(SymbolRow {
            usr,
            spelling: self.text(name),
            kind: kind.to_string(),
            span: span_of(name),
        });
    }

    fn occurrence(&mut self, node: &Node) {
        let kind = match node.kind() {
            "type_identifier" => "type",
            "field_identifier" => "member",
            "namespace_identifier" => "namespace",
            _ => "identifier",
        };
        self.out.occurrences.push(Occurrence {
            spelling: self.text(node),
            kind,
            span: span_of(node),
            usr: self.def_names.get(&node.start_byte()).cloned(),
        });
    }

    fn diagnostic(&mut self, node: &Node, message: String) {
        let pos = node.start_position();
        self.out.diagnostics.push(Diagnostic {
            line: pos.row + 1,
            col: pos.column + 1,
            message,
        });
    }

    fn text(&self, node: &Node) -> String {
        String::from_utf8_lossy(&self.source[node.byte_range()]).into_owned()
    }
}

fn qualifiers_as_components(qualifiers: &[String], namespaces: &HashSet<String>) -> Vec<String> {
    qualifiers
        .iter()
        .map(|q| {
            if namespaces.contains(q) {
                format!("@N@{q}")
            } else {
                format!("@S@{q}")
            }
        })
        .collect()
}

fn span_of(node: &Node) -> Span {
    let pos = node.start_position();
    Span {
        offset1: node.start_byte(),
        offset2: node.end_byte(),
        line: pos.row + 1,
        col: pos.column + 1,
    }
}

fn children_by_field<'t>(node: &Node<'t>, field: &str) -> Vec<Node<'t>> {
    let mut cursor = node.walk();
    node.children_by_field_name(field, &mut cursor).collect()
}

/// Follow nested declarators down to a function declarator, if any.
fn find_function_declarator<'t>(node: &Node<'t>) -> Option<Node<'t>> {
    let mut current = *node;
    loop {
        if current.kind() == "function_declarator" {
            return Some(current);
        }
        current = current.child_by_field_name("declarator")?;
    }
}

/// Name of a variable / field / typedef declarator. `None` for function
/// declarators (prototypes are not definitions).
fn declarator_name<'t>(node: &Node<'t>) -> Option<Node<'t>> {
    let mut current = *node;
    loop {
        match current.kind() {
            "identifier" | "field_identifier" | "type_identifier" => return Some(current),
            "function_declarator" => return None,
            _ => current = current.child_by_field_name("declarator")?,
        }
    }
}
