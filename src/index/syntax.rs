//! Tree-sitter extraction of declarations and call sites.
//!
//! Symbol naming matches the line-based extractor: dot-qualified, Java
//! nested types joined with `$`, Java constructors named `<init>`. Returns
//! `None` when the grammar cannot produce an error-free tree, so the caller
//! can fall back to the line-based path.

use std::cell::RefCell;

use tree_sitter::{Node, Parser, Tree};

use super::extract::{
    python_module_path, qualify, rust_module_path, FileSymbols, JAVA_KEYWORDS, PYTHON_KEYWORDS,
    RUST_KEYWORDS,
};
use super::{Language, Reference, SymbolDef, SymbolKind};

// Parsers are reused per thread; index builds run on blocking worker threads.
thread_local! {
    static JAVA_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        // A failed set_language surfaces as a failed parse.
        let _ = p.set_language(&tree_sitter_java::LANGUAGE.into());
        p
    });

    static PYTHON_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        let _ = p.set_language(&tree_sitter_python::LANGUAGE.into());
        p
    });

    static RUST_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        let _ = p.set_language(&tree_sitter_rust::LANGUAGE.into());
        p
    });
}

fn parse(language: Language, source: &str) -> Option<Tree> {
    match language {
        Language::Java => JAVA_PARSER.with(|p| p.borrow_mut().parse(source, None)),
        Language::Python => PYTHON_PARSER.with(|p| p.borrow_mut().parse(source, None)),
        Language::Rust => RUST_PARSER.with(|p| p.borrow_mut().parse(source, None)),
    }
}

/// Extract symbols from a syntax tree, or `None` if the file does not parse
/// cleanly.
pub fn extract(language: Language, rel_path: &str, source: &str) -> Option<FileSymbols> {
    let tree = parse(language, source)?;
    let root = tree.root_node();
    if root.has_error() {
        return None;
    }

    let mut collector = Collector {
        rel_path,
        source,
        lines: source.lines().collect(),
        package: String::new(),
        symbols: FileSymbols::default(),
    };
    match language {
        Language::Java => collector.java(root, None),
        Language::Python => {
            let module = python_module_path(rel_path);
            collector.python(root, &module, false);
        }
        Language::Rust => {
            let module = rust_module_path(rel_path);
            collector.rust(root, &module, false);
        }
    }
    Some(collector.symbols)
}

/// Named children of `node`, in source order.
fn children<'t>(node: Node<'t>) -> Vec<Node<'t>> {
    let mut cursor = node.walk();
    node.named_children(&mut cursor).collect()
}

struct Collector<'s> {
    rel_path: &'s str,
    source: &'s str,
    lines: Vec<&'s str>,
    package: String,
    symbols: FileSymbols,
}

impl<'s> Collector<'s> {
    fn text(&self, node: Node<'_>) -> &'s str {
        node.utf8_text(self.source.as_bytes()).unwrap_or("")
    }

    /// Record a declaration spanning `node`, named by its `name` field.
    fn define(&mut self, node: Node<'_>, name: Node<'_>, symbol: String, kind: SymbolKind) {
        let start = node.start_position().row + 1;
        let end_pos = node.end_position();
        // A node ending at column 0 stops before that line.
        let end = if end_pos.column == 0 && end_pos.row > node.start_position().row {
            end_pos.row
        } else {
            end_pos.row + 1
        };
        let signature = self
            .lines
            .get(name.start_position().row)
            .map(|l| l.trim().to_string())
            .unwrap_or_default();
        self.symbols.defs.push(SymbolDef {
            symbol,
            kind,
            file: self.rel_path.to_string(),
            start,
            end: end.max(start),
            signature,
        });
    }

    fn reference(&mut self, node: Node<'_>, name: &str, keywords: &[&str]) {
        if name.is_empty() || keywords.contains(&name) {
            return;
        }
        self.symbols.refs.push(Reference {
            name: name.to_string(),
            file: self.rel_path.to_string(),
            line: node.start_position().row + 1,
            col: node.start_position().column + 1,
        });
    }

    /// `scope` is the qualified symbol of the enclosing type.
    fn java(&mut self, node: Node<'_>, scope: Option<&str>) {
        for child in children(node) {
            match child.kind() {
                "package_declaration" => {
                    if let Some(name) = children(child)
                        .into_iter()
                        .find(|n| matches!(n.kind(), "scoped_identifier" | "identifier"))
                    {
                        self.package = self.text(name).to_string();
                    }
                }
                "class_declaration" | "interface_declaration" | "enum_declaration"
                | "record_declaration" | "annotation_type_declaration" => {
                    let Some(name) = child.child_by_field_name("name") else {
                        self.java(child, scope);
                        continue;
                    };
                    let simple = self.text(name).to_string();
                    let symbol = match scope {
                        Some(outer) => format!("{outer}${simple}"),
                        None => qualify(&self.package, &simple),
                    };
                    let kind = match child.kind() {
                        "interface_declaration" | "annotation_type_declaration" => SymbolKind::Interface,
                        "enum_declaration" => SymbolKind::Enum,
                        "record_declaration" => SymbolKind::Record,
                        _ => SymbolKind::Class,
                    };
                    self.define(child, name, symbol.clone(), kind);
                    self.java(child, Some(symbol.as_str()));
                }
                "method_declaration" | "constructor_declaration" | "compact_constructor_declaration" => {
                    if let (Some(outer), Some(name)) = (scope, child.child_by_field_name("name")) {
                        let (member, kind) = if child.kind() == "method_declaration" {
                            (self.text(name), SymbolKind::Method)
                        } else {
                            ("<init>", SymbolKind::Constructor)
                        };
                        let symbol = format!("{outer}.{member}");
                        self.define(child, name, symbol, kind);
                    }
                    self.java(child, scope);
                }
                "method_invocation" => {
                    if let Some(name) = child.child_by_field_name("name") {
                        let text = self.text(name);
                        self.reference(name, text, JAVA_KEYWORDS);
                    }
                    self.java(child, scope);
                }
                "object_creation_expression" => {
                    if let Some(ty) = child.child_by_field_name("type") {
                        let simple = simple_type_name(self.text(ty), ".");
                        self.reference(ty, simple, JAVA_KEYWORDS);
                    }
                    self.java(child, scope);
                }
                _ => self.java(child, scope),
            }
        }
    }

    fn python(&mut self, node: Node<'_>, prefix: &str, in_class: bool) {
        for child in children(node) {
            match child.kind() {
                "class_definition" | "function_definition" => {
                    let Some(name) = child.child_by_field_name("name") else {
                        self.python(child, prefix, false);
                        continue;
                    };
                    let symbol = qualify(prefix, self.text(name));
                    let is_class = child.kind() == "class_definition";
                    let kind = match (is_class, in_class) {
                        (true, _) => SymbolKind::Class,
                        (false, true) => SymbolKind::Method,
                        (false, false) => SymbolKind::Function,
                    };
                    self.define(child, name, symbol.clone(), kind);
                    self.python(child, &symbol, is_class);
                }
                "call" => {
                    if let Some(function) = child.child_by_field_name("function") {
                        let callee = match function.kind() {
                            "attribute" => function.child_by_field_name("attribute"),
                            "identifier" => Some(function),
                            _ => None,
                        };
                        if let Some(callee) = callee {
                            let text = self.text(callee);
                            self.reference(callee, text, PYTHON_KEYWORDS);
                        }
                    }
                    self.python(child, prefix, in_class);
                }
                // Class bodies stay class bodies through decorators and blocks.
                _ => self.python(child, prefix, in_class),
            }
        }
    }

    fn rust(&mut self, node: Node<'_>, prefix: &str, in_impl: bool) {
        for child in children(node) {
            match child.kind() {
                "function_item" | "function_signature_item" => {
                    if let Some(name) = child.child_by_field_name("name") {
                        let kind = if in_impl {
                            SymbolKind::Method
                        } else {
                            SymbolKind::Function
                        };
                        self.define(child, name, qualify(prefix, self.text(name)), kind);
                    }
                    self.rust(child, prefix, false);
                }
                "struct_item" | "union_item" | "enum_item" | "trait_item" | "mod_item" => {
                    let Some(name) = child.child_by_field_name("name") else {
                        self.rust(child, prefix, false);
                        continue;
                    };
                    let kind = match child.kind() {
                        "enum_item" => SymbolKind::Enum,
                        "trait_item" => SymbolKind::Trait,
                        "mod_item" => SymbolKind::Module,
                        _ => SymbolKind::Struct,
                    };
                    let symbol = qualify(prefix, self.text(name));
                    self.define(child, name, symbol.clone(), kind);
                    self.rust(child, &symbol, kind == SymbolKind::Trait);
                }
                "impl_item" => {
                    let Some(ty) = child.child_by_field_name("type") else {
                        self.rust(child, prefix, false);
                        continue;
                    };
                    let symbol = qualify(prefix, simple_type_name(self.text(ty), "::"));
                    self.define(child, ty, symbol.clone(), SymbolKind::Impl);
                    self.rust(child, &symbol, true);
                }
                "call_expression" => {
                    if let Some(callee) = child.child_by_field_name("function").and_then(rust_callee) {
                        let text = self.text(callee);
                        self.reference(callee, text, RUST_KEYWORDS);
                    }
                    self.rust(child, prefix, false);
                }
                "macro_invocation" => {
                    if let Some(callee) = child.child_by_field_name("macro").and_then(rust_callee) {
                        let text = self.text(callee);
                        self.reference(callee, text, RUST_KEYWORDS);
                    }
                }
                _ => self.rust(child, prefix, in_impl && child.kind() == "declaration_list"),
            }
        }
    }
}

/// The identifier actually being called: `b` in `a.b(..)`, `c` in `a::c(..)`.
fn rust_callee(mut node: Node<'_>) -> Option<Node<'_>> {
    loop {
        node = match node.kind() {
            "identifier" => return Some(node),
            "field_expression" => node.child_by_field_name("field")?,
            "scoped_identifier" => node.child_by_field_name("name")?,
            "generic_function" => node.child_by_field_name("function")?,
            _ => return None,
        };
    }
}

/// `a.b.Name<T>` -> `Name`, splitting on `sep`.
fn simple_type_name<'t>(text: &'t str, sep: &str) -> &'t str {
    let base = text.split('<').next().unwrap_or(text).trim();
    base.rsplit(sep).next().unwrap_or(base).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn find<'a>(symbols: &'a FileSymbols, symbol: &str) -> &'a SymbolDef {
        symbols
            .defs
            .iter()
            .find(|d| d.symbol == symbol)
            .unwrap_or_else(|| panic!("missing {symbol}: {:?}", symbols.defs))
    }

    #[test]
    fn test_java_multiline_signature_and_annotations() {
        let source = r#"package org.ex;

public class Repo<T> {
    @Override
    public String toString() {
        return "Repo{" + size() + "}";
    }

    public java.util.List<T> find(
            String query,
            int limit) {
        return new java.util.ArrayList<T>();
    }

    enum Mode { READ, WRITE; void check() {} }
}
"#;
        let symbols = extract(Language::Java, "Repo.java", source).unwrap();

        let to_string = find(&symbols, "org.ex.Repo.toString");
        assert_eq!((to_string.start, to_string.end), (4, 7));
        assert_eq!(to_string.signature, "public String toString() {");

        let find_method = find(&symbols, "org.ex.Repo.find");
        assert_eq!((find_method.start, find_method.end), (9, 13));

        let mode = find(&symbols, "org.ex.Repo$Mode");
        assert_eq!(mode.kind, SymbolKind::Enum);
        assert_eq!(find(&symbols, "org.ex.Repo$Mode.check").kind, SymbolKind::Method);

        let refs: Vec<(&str, usize)> = symbols.refs.iter().map(|r| (r.name.as_str(), r.line)).collect();
        assert_eq!(refs, vec![("size", 6), ("ArrayList", 12)]);
    }

    #[test]
    fn test_rust_generic_impl_and_nested_module() {
        let source = r#"mod inner {
    pub trait Shape {
        fn area(&self) -> f64;
    }
}

impl<T: Clone> std::fmt::Display for Wrapper<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", helpers::render(&self.0))
    }
}
"#;
        let symbols = extract(Language::Rust, "src/shapes.rs", source).unwrap();

        assert_eq!(find(&symbols, "shapes.inner").kind, SymbolKind::Module);
        assert_eq!(find(&symbols, "shapes.inner.Shape").kind, SymbolKind::Trait);
        assert_eq!(find(&symbols, "shapes.inner.Shape.area").kind, SymbolKind::Method);

        let imp = find(&symbols, "shapes.Wrapper");
        assert_eq!(imp.kind, SymbolKind::Impl);
        assert_eq!((imp.start, imp.end), (7, 11));
        let fmt = find(&symbols, "shapes.Wrapper.fmt");
        assert_eq!(fmt.kind, SymbolKind::Method);

        let names: Vec<&str> = symbols.refs.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["write"]);
    }

    #[test]
    fn test_python_decorated_methods_stay_methods() {
        let source = "class Box:\n    @property\n    def size(self):\n        return len(self.items)\n\n    @staticmethod\n    def empty():\n        return Box()\n";
        let symbols = extract(Language::Python, "box.py", source).unwrap();

        assert_eq!(find(&symbols, "box.Box.size").kind, SymbolKind::Method);
        let empty = find(&symbols, "box.Box.empty");
        assert_eq!(empty.kind, SymbolKind::Method);
        assert_eq!((empty.start, empty.end), (7, 8));
        assert!(symbols.refs.iter().any(|r| r.name == "Box" && r.line == 8));
        assert!(symbols.refs.iter().any(|r| r.name == "len" && r.col == 16));
    }

    #[test]
    fn test_syntax_errors_decline() {
        assert!(extract(Language::Java, "Broken.java", "public class Broken { void f( { }").is_none());
        assert!(extract(Language::Python, "broken.py", "def f(:\n    pass\n").is_none());
    }
}
