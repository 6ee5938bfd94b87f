//! Declaration and reference extraction.
//!
//! [`extract`] parses with tree-sitter (see [`super::syntax`]) and falls back
//! to a line-based pass when the grammar reports a syntax error, which is
//! common for the half-edited files of a buggy checkout.
//!
//! In the line-based pass, brace languages (Java, Rust) run through a small line lexer that blanks
//! out comments and string/char literals, then track brace depth to find
//! where each declaration's body closes. Python uses indentation instead.
//! Symbols are dot-qualified for every language; Java nested types use `$`
//! and constructors are named `<init>`.

use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use super::{Language, Reference, SymbolDef, SymbolKind};

/// Declarations and call sites found in one file.
#[derive(Debug, Default, Clone)]
pub struct FileSymbols {
    pub defs: Vec<SymbolDef>,
    pub refs: Vec<Reference>,
}

/// Extract symbols from `source`, a file at `rel_path` inside the working copy.
pub fn extract(language: Language, rel_path: &str, source: &str) -> FileSymbols {
    super::syntax::extract(language, rel_path, source).unwrap_or_else(|| {
        debug!(file = rel_path, ?language, "Syntax tree unavailable, using line-based extraction");
        extract_lines(language, rel_path, source)
    })
}

/// Line-based extraction. Tolerates syntax errors.
pub fn extract_lines(language: Language, rel_path: &str, source: &str) -> FileSymbols {
    match language {
        Language::Java => extract_java(rel_path, source),
        Language::Python => extract_python(rel_path, source),
        Language::Rust => extract_rust(rel_path, source),
    }
}

pub(super) const JAVA_KEYWORDS: &[&str] = &[
    "if", "for", "while", "switch", "catch", "return", "throw", "new", "synchronized", "do",
    "try", "else", "case", "default", "super", "this", "assert",
];

pub(super) const PYTHON_KEYWORDS: &[&str] = &[
    "if", "elif", "for", "while", "return", "and", "or", "not", "in", "is", "with", "assert",
    "except", "lambda", "yield", "await", "def", "class", "print",
];

pub(super) const RUST_KEYWORDS: &[&str] = &[
    "if", "for", "while", "match", "return", "loop", "fn", "in", "as", "Some", "Ok", "Err",
    "move", "where", "impl", "dyn",
];

fn call_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b([A-Za-z_][A-Za-z0-9_]*)\s*!?\s*\(").expect("Invalid call regex"))
}

fn java_package_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*package\s+([A-Za-z0-9_.]+)\s*;").expect("Invalid package regex")
    })
}

fn java_type_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(class|interface|enum|record)\s+([A-Za-z_][A-Za-z0-9_]*)")
            .expect("Invalid type regex")
    })
}

fn java_method_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^\s*(?:@\w+(?:\([^)]*\))?\s+)*(?:(?:public|protected|private|static|final|abstract|synchronized|native|default|strictfp)\s+)*(?:<[^>]*>\s*)?(?:([\w.$\[\]<>,?& ]+?)\s+)?([A-Za-z_][A-Za-z0-9_]*)\s*\(",
        )
        .expect("Invalid method regex")
    })
}

fn rust_fn_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:(?:const|async|unsafe|extern(?:\s+"[^"]*")?)\s+)*fn\s+([A-Za-z_][A-Za-z0-9_]*)"#,
        )
        .expect("Invalid fn regex")
    })
}

fn rust_type_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(?:pub(?:\([^)]*\))?\s+)?(struct|enum|trait|mod|union)\s+([A-Za-z_][A-Za-z0-9_]*)")
            .expect("Invalid type regex")
    })
}

fn rust_impl_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(?:unsafe\s+)?impl\b(?:\s*<[^{]*?>)?\s+(?:[\w:<>, &']+?\s+for\s+)?([\w:]+)")
            .expect("Invalid impl regex")
    })
}

fn python_def_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\s*)(?:async\s+)?(def|class)\s+([A-Za-z_][A-Za-z0-9_]*)")
            .expect("Invalid def regex")
    })
}

/// Line lexer for C-family syntax. Comments and literal contents are
/// replaced so braces and parentheses inside them are never counted.
#[derive(Default)]
struct CLexer {
    in_block_comment: bool,
    in_string: bool,
}

impl CLexer {
    fn strip(&mut self, line: &str) -> String {
        let chars: Vec<char> = line.chars().collect();
        let mut out = String::with_capacity(line.len());
        let mut i = 0;
        while i < chars.len() {
            let ch = chars[i];
            let next = chars.get(i + 1).copied();

            if self.in_block_comment {
                if ch == '*' && next == Some('/') {
                    self.in_block_comment = false;
                    i += 2;
                } else {
                    i += 1;
                }
                continue;
            }

            if self.in_string {
                if ch == '\\' {
                    i += 2;
                    continue;
                }
                if ch == '"' {
                    self.in_string = false;
                    out.push('"');
                }
                i += 1;
                continue;
            }

            match ch {
                '/' if next == Some('/') => break,
                '/' if next == Some('*') => {
                    self.in_block_comment = true;
                    i += 2;
                }
                '"' => {
                    self.in_string = true;
                    out.push('"');
                    i += 1;
                }
                '\'' => {
                    // Char literal ('x' or '\n'); anything else is a Rust lifetime.
                    if next == Some('\\') {
                        let close = chars[i + 2..].iter().position(|c| *c == '\'');
                        i = close.map(|p| i + 3 + p).unwrap_or(chars.len());
                        out.push_str("' '");
                    } else if chars.get(i + 2) == Some(&'\'') {
                        i += 3;
                        out.push_str("' '");
                    } else {
                        out.push(ch);
                        i += 1;
                    }
                }
                _ => {
                    out.push(ch);
                    i += 1;
                }
            }
        }
        out
    }
}

/// A declaration waiting for its opening brace (or terminating `;`).
struct Pending {
    def_idx: usize,
    scope: Option<String>,
    since_line: usize,
}

/// A named scope (type, impl or module) whose body is open.
struct Scope {
    qualified: String,
    simple: String,
    kind: SymbolKind,
    depth: usize,
}

/// Shared brace-tracking walk for Java and Rust.
struct BraceWalker {
    defs: Vec<SymbolDef>,
    refs: Vec<Reference>,
    scopes: Vec<Scope>,
    open: Vec<(usize, usize)>,
    pending: Option<Pending>,
    last_declared: Option<(usize, String)>,
    depth: usize,
}

/// Declarations never wait more than this many lines for their body.
const MAX_SIGNATURE_LINES: usize = 12;

impl BraceWalker {
    fn new() -> Self {
        Self {
            defs: Vec::new(),
            refs: Vec::new(),
            scopes: Vec::new(),
            open: Vec::new(),
            pending: None,
            last_declared: None,
            depth: 0,
        }
    }

    /// True when the walker sits directly inside the innermost scope's body.
    fn at_scope_body(&self) -> bool {
        self.scopes
            .last()
            .map(|s| s.depth == self.depth)
            .unwrap_or(self.depth == 0)
    }

    /// Record a declaration of `name` whose body is still to come.
    fn declare(&mut self, def: SymbolDef, name: &str, scope: Option<String>, line: usize) {
        if let Some(p) = self.pending.take() {
            self.defs[p.def_idx].end = self.defs[p.def_idx].start;
        }
        self.last_declared = Some((line, name.to_string()));
        self.defs.push(def);
        self.pending = Some(Pending {
            def_idx: self.defs.len() - 1,
            scope,
            since_line: line,
        });
    }

    fn expire_pending(&mut self, line: usize) {
        let stale = self
            .pending
            .as_ref()
            .map(|p| line.saturating_sub(p.since_line) > MAX_SIGNATURE_LINES)
            .unwrap_or(false);
        if stale {
            if let Some(p) = self.pending.take() {
                self.defs[p.def_idx].end = self.defs[p.def_idx].start;
            }
        }
    }

    fn walk_braces(&mut self, stripped: &str, line: usize) {
        for ch in stripped.chars() {
            match ch {
                '{' => {
                    self.depth += 1;
                    if let Some(p) = self.pending.take() {
                        self.open.push((p.def_idx, self.depth));
                        if let Some(simple) = p.scope {
                            let def = &self.defs[p.def_idx];
                            self.scopes.push(Scope {
                                qualified: def.symbol.clone(),
                                simple,
                                kind: def.kind,
                                depth: self.depth,
                            });
                        }
                    }
                }
                '}' => {
                    if let Some(&(idx, depth)) = self.open.last() {
                        if depth == self.depth {
                            self.defs[idx].end = line;
                            self.open.pop();
                        }
                    }
                    if self.scopes.last().map(|s| s.depth) == Some(self.depth) {
                        self.scopes.pop();
                    }
                    self.depth = self.depth.saturating_sub(1);
                }
                ';' => {
                    if let Some(p) = self.pending.take() {
                        self.defs[p.def_idx].end = line;
                    }
                }
                _ => {}
            }
        }
    }

    fn collect_refs(&mut self, rel_path: &str, stripped: &str, line: usize, keywords: &[&str]) {
        let declared_here: Option<&str> = self
            .last_declared
            .as_ref()
            .filter(|(decl_line, _)| *decl_line == line)
            .map(|(_, name)| name.as_str());
        for caps in call_re().captures_iter(stripped) {
            let Some(m) = caps.get(1) else { continue };
            let name = m.as_str();
            if keywords.contains(&name) || declared_here == Some(name) {
                continue;
            }
            self.refs.push(Reference {
                name: name.to_string(),
                file: rel_path.to_string(),
                line,
                col: m.start() + 1,
            });
        }
    }

    fn finish(mut self, line_count: usize) -> FileSymbols {
        if let Some(p) = self.pending.take() {
            self.defs[p.def_idx].end = self.defs[p.def_idx].start;
        }
        for (idx, _) in self.open.drain(..) {
            self.defs[idx].end = line_count.max(self.defs[idx].start);
        }
        FileSymbols {
            defs: self.defs,
            refs: self.refs,
        }
    }
}

pub(super) fn qualify(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

fn extract_java(rel_path: &str, source: &str) -> FileSymbols {
    let mut lexer = CLexer::default();
    let mut walker = BraceWalker::new();
    let mut package = String::new();
    let mut line_count = 0;

    for (i, raw) in source.lines().enumerate() {
        let line = i + 1;
        line_count = line;
        let stripped = lexer.strip(raw);
        walker.expire_pending(line);

        if let Some(caps) = java_package_re().captures(&stripped) {
            package = caps[1].to_string();
        }

        if walker.pending.is_none() {
            if let Some(caps) = java_type_re().captures(&stripped) {
                let kind = match &caps[1] {
                    "interface" => SymbolKind::Interface,
                    "enum" => SymbolKind::Enum,
                    "record" => SymbolKind::Record,
                    _ => SymbolKind::Class,
                };
                let name = caps[2].to_string();
                let symbol = match walker.scopes.last() {
                    Some(outer) => format!("{}${}", outer.qualified, name),
                    None => qualify(&package, &name),
                };
                walker.declare(
                    SymbolDef {
                        symbol,
                        kind,
                        file: rel_path.to_string(),
                        start: line,
                        end: line,
                        signature: raw.trim().to_string(),
                    },
                    &name,
                    Some(name.clone()),
                    line,
                );
            } else if !walker.scopes.is_empty() && walker.at_scope_body() {
                if let Some(caps) = java_method_re().captures(&stripped) {
                    let name = &caps[2];
                    let has_type = caps
                        .get(1)
                        .map(|t| !t.as_str().trim().is_empty())
                        .unwrap_or(false);
                    let (class_symbol, class_name) = walker
                        .scopes
                        .last()
                        .map(|s| (s.qualified.clone(), s.simple.clone()))
                        .unwrap_or_default();
                    let is_ctor = name == class_name;
                    if !JAVA_KEYWORDS.contains(&name) && (has_type || is_ctor) {
                        let (member, kind) = if is_ctor {
                            ("<init>", SymbolKind::Constructor)
                        } else {
                            (name, SymbolKind::Method)
                        };
                        walker.declare(
                            SymbolDef {
                                symbol: format!("{class_symbol}.{member}"),
                                kind,
                                file: rel_path.to_string(),
                                start: line,
                                end: line,
                                signature: raw.trim().to_string(),
                            },
                            name,
                            None,
                            line,
                        );
                    }
                }
            }
        }

        walker.collect_refs(rel_path, &stripped, line, JAVA_KEYWORDS);
        walker.walk_braces(&stripped, line);
    }

    walker.finish(line_count)
}

/// `src/foo/bar.rs` -> `foo.bar`; `lib.rs`, `main.rs` and `mod.rs` name their parent.
pub(super) fn rust_module_path(rel_path: &str) -> String {
    let trimmed = rel_path.strip_prefix("src/").unwrap_or(rel_path);
    let trimmed = trimmed.strip_suffix(".rs").unwrap_or(trimmed);
    let mut parts: Vec<&str> = trimmed.split('/').filter(|p| !p.is_empty()).collect();
    if matches!(parts.last(), Some(&"mod") | Some(&"lib") | Some(&"main")) {
        parts.pop();
    }
    parts.join(".")
}

fn extract_rust(rel_path: &str, source: &str) -> FileSymbols {
    let mut lexer = CLexer::default();
    let mut walker = BraceWalker::new();
    let module = rust_module_path(rel_path);
    let mut line_count = 0;

    for (i, raw) in source.lines().enumerate() {
        let line = i + 1;
        line_count = line;
        let stripped = lexer.strip(raw);
        walker.expire_pending(line);

        if walker.pending.is_none() {
            let prefix = walker
                .scopes
                .last()
                .map(|s| s.qualified.clone())
                .unwrap_or_else(|| module.clone());

            if let Some(caps) = rust_fn_re().captures(&stripped) {
                let in_impl = matches!(
                    walker.scopes.last().map(|s| s.kind),
                    Some(SymbolKind::Impl) | Some(SymbolKind::Trait)
                );
                walker.declare(
                    SymbolDef {
                        symbol: qualify(&prefix, &caps[1]),
                        kind: if in_impl {
                            SymbolKind::Method
                        } else {
                            SymbolKind::Function
                        },
                        file: rel_path.to_string(),
                        start: line,
                        end: line,
                        signature: raw.trim().to_string(),
                    },
                    &caps[1],
                    None,
                    line,
                );
            } else if let Some(caps) = rust_type_re().captures(&stripped) {
                let kind = match &caps[1] {
                    "enum" => SymbolKind::Enum,
                    "trait" => SymbolKind::Trait,
                    "mod" => SymbolKind::Module,
                    _ => SymbolKind::Struct,
                };
                let name = caps[2].to_string();
                walker.declare(
                    SymbolDef {
                        symbol: qualify(&prefix, &name),
                        kind,
                        file: rel_path.to_string(),
                        start: line,
                        end: line,
                        signature: raw.trim().to_string(),
                    },
                    &name,
                    Some(name.clone()),
                    line,
                );
            } else if let Some(caps) = rust_impl_re().captures(&stripped) {
                let target = caps[1].rsplit("::").next().unwrap_or(&caps[1]).to_string();
                walker.declare(
                    SymbolDef {
                        symbol: qualify(&module, &target),
                        kind: SymbolKind::Impl,
                        file: rel_path.to_string(),
                        start: line,
                        end: line,
                        signature: raw.trim().to_string(),
                    },
                    &target,
                    Some(target.clone()),
                    line,
                );
            }
        }

        walker.collect_refs(rel_path, &stripped, line, RUST_KEYWORDS);
        walker.walk_braces(&stripped, line);
    }

    walker.finish(line_count)
}

/// `pkg/sub/mod.py` -> `pkg.sub.mod`; `__init__.py` names its package.
pub(super) fn python_module_path(rel_path: &str) -> String {
    let trimmed = rel_path.strip_suffix(".py").unwrap_or(rel_path);
    let mut parts: Vec<&str> = trimmed.split('/').filter(|p| !p.is_empty()).collect();
    if parts.last() == Some(&"__init__") {
        parts.pop();
    }
    parts.join(".")
}

fn strip_python_comment(line: &str) -> &str {
    match line.find('#') {
        Some(pos) => &line[..pos],
        None => line,
    }
}

fn extract_python(rel_path: &str, source: &str) -> FileSymbols {
    let module = python_module_path(rel_path);
    let mut defs: Vec<SymbolDef> = Vec::new();
    let mut refs: Vec<Reference> = Vec::new();
    // (indent, def index, kind)
    let mut stack: Vec<(usize, usize, SymbolKind)> = Vec::new();
    let mut last_code_line = 0;

    for (i, raw) in source.lines().enumerate() {
        let line = i + 1;
        let code = strip_python_comment(raw);
        if code.trim().is_empty() {
            continue;
        }
        let indent = code.len() - code.trim_start().len();

        while let Some(&(scope_indent, idx, _)) = stack.last() {
            if indent > scope_indent {
                break;
            }
            defs[idx].end = last_code_line.max(defs[idx].start);
            stack.pop();
        }

        let mut declared: Option<String> = None;
        if let Some(caps) = python_def_re().captures(code) {
            let name = caps[3].to_string();
            let parent = stack.last().map(|&(_, idx, kind)| (defs[idx].symbol.clone(), kind));
            let kind = match (&caps[2], parent.as_ref().map(|p| p.1)) {
                ("class", _) => SymbolKind::Class,
                ("def", Some(SymbolKind::Class)) => SymbolKind::Method,
                _ => SymbolKind::Function,
            };
            let prefix = parent.map(|p| p.0).unwrap_or_else(|| module.clone());
            defs.push(SymbolDef {
                symbol: qualify(&prefix, &name),
                kind,
                file: rel_path.to_string(),
                start: line,
                end: line,
                signature: raw.trim().to_string(),
            });
            stack.push((indent, defs.len() - 1, kind));
            declared = Some(name);
        }

        for caps in call_re().captures_iter(code) {
            let Some(m) = caps.get(1) else { continue };
            let name = m.as_str();
            if PYTHON_KEYWORDS.contains(&name) || declared.as_deref() == Some(name) {
                continue;
            }
            refs.push(Reference {
                name: name.to_string(),
                file: rel_path.to_string(),
                line,
                col: m.start() + 1,
            });
        }

        last_code_line = line;
    }

    for (_, idx, _) in stack.drain(..) {
        defs[idx].end = last_code_line.max(defs[idx].start);
    }

    FileSymbols { defs, refs }
}
