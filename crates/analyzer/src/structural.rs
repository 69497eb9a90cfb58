//! Authoritative check over the Tree-sitter Python syntax tree.

use tree_sitter::{Node, Parser, Tree};

use crate::denylist::{
    is_banned_builtin, is_dunder, is_io_attribute, is_restricted_namespace, CODEGEN_ATTRIBUTES,
    DUNDER_STRING_MARKERS, PATH_KEYWORDS, TEXT_WRITER_ATTRIBUTES,
};
use crate::verdict::{Location, Violation};
use crate::{AnalysisPolicy, AnalyzerError};

pub const SYNTAX_ERROR: &str = "ast:syntax-error";
pub const IMPORT_NOT_ALLOWED: &str = "ast:import-not-allowed";
pub const BANNED_BUILTIN: &str = "ast:banned-builtin";
pub const DUNDER_NAME: &str = "ast:dunder-name";
pub const DUNDER_ATTRIBUTE: &str = "ast:dunder-attribute";
pub const RESTRICTED_NAMESPACE: &str = "ast:restricted-namespace";
pub const CODE_GENERATION: &str = "ast:code-generation";
pub const FILESYSTEM_IO: &str = "ast:filesystem-io";
pub const DUNDER_STRING: &str = "ast:dunder-string";

/// Parse Python source into a Tree-sitter tree.
pub fn parse_python(source: &str) -> Result<Tree, AnalyzerError> {
    let mut parser = Parser::new();
    parser
        .set_language(tree_sitter_python::language())
        .map_err(|e| AnalyzerError::Language(e.to_string()))?;

    parser.parse(source, None).ok_or(AnalyzerError::ParseAborted)
}

/// Walk the whole tree and collect every violation.
pub fn check(source: &str, policy: &AnalysisPolicy) -> Result<Vec<Violation>, AnalyzerError> {
    let tree = parse_python(source)?;
    let mut walker = Walker {
        source: source.as_bytes(),
        policy,
        violations: Vec::new(),
    };
    walker.walk(tree.root_node());
    Ok(walker.violations)
}

struct Walker<'a> {
    source: &'a [u8],
    policy: &'a AnalysisPolicy,
    violations: Vec<Violation>,
}

impl<'a> Walker<'a> {
    /// Explicit work stack instead of recursion; nesting depth of the input
    /// never reaches the call stack.
    fn walk(&mut self, root: Node<'_>) {
        let mut stack = vec![root];

        while let Some(node) = stack.pop() {
            if node.is_missing() {
                let kind = node.kind().to_string();
                self.report(
                    SYNTAX_ERROR,
                    node,
                    format!("Syntax error: missing `{}`", kind),
                );
                continue;
            }
            if node.is_error() {
                self.report(SYNTAX_ERROR, node, "Syntax error: source does not parse".to_string());
            }

            match node.kind() {
                "import_statement" => self.check_import(node),
                "import_from_statement" => self.check_import_from(node),
                "future_import_statement" => {}
                "exec_statement" => {
                    self.report(
                        CODE_GENERATION,
                        node,
                        "`exec` statements execute generated code".to_string(),
                    );
                }
                "identifier" => self.check_identifier(node),
                "attribute" => {
                    self.check_attribute(node);
                    if let Some(object) = node.child_by_field_name("object") {
                        stack.push(object);
                    }
                }
                "keyword_argument" => {
                    if let Some(value) = node.child_by_field_name("value") {
                        stack.push(value);
                    }
                }
                "call" => {
                    self.check_call(node);
                    push_children(node, &mut stack);
                }
                "string" => {
                    self.check_string(node);
                    push_children(node, &mut stack);
                }
                _ => push_children(node, &mut stack),
            }
        }
    }

    fn text(&self, node: Node<'_>) -> &'a str {
        node.utf8_text(self.source).unwrap_or("")
    }

    fn report(&mut self, pattern_id: &str, node: Node<'_>, message: String) {
        self.violations.push(Violation::structural(
            pattern_id,
            Location::from_point(node.start_position()),
            message,
        ));
    }

    fn check_module(&mut self, node: Node<'_>) {
        let module: String = self.text(node).split_whitespace().collect();
        if !self.policy.is_module_allowed(&module) {
            self.report(
                IMPORT_NOT_ALLOWED,
                node,
                format!("Import of module `{}` is not allowed", module),
            );
        }
    }

    /// Names bound by an import must not shadow or smuggle restricted objects.
    fn check_bound_name(&mut self, node: Node<'_>) {
        let name = self.text(node);
        let restricted = name.split('.').any(|segment| {
            let segment = segment.trim();
            is_restricted_namespace(segment) || is_dunder(segment) || is_banned_builtin(segment)
        });
        if restricted {
            self.report(
                IMPORT_NOT_ALLOWED,
                node,
                format!("Importing the name `{}` is not allowed", name),
            );
        }
    }

    fn check_import(&mut self, node: Node<'_>) {
        let mut cursor = node.walk();
        let names: Vec<Node<'_>> = node.children_by_field_name("name", &mut cursor).collect();

        for name in names {
            if name.kind() == "aliased_import" {
                if let Some(module) = name.child_by_field_name("name") {
                    self.check_module(module);
                }
                if let Some(alias) = name.child_by_field_name("alias") {
                    self.check_bound_name(alias);
                }
            } else {
                self.check_module(name);
            }
        }
    }

    fn check_import_from(&mut self, node: Node<'_>) {
        match node.child_by_field_name("module_name") {
            Some(module) if module.kind() == "relative_import" => {
                self.report(
                    IMPORT_NOT_ALLOWED,
                    module,
                    "Relative imports are not allowed".to_string(),
                );
            }
            Some(module) => self.check_module(module),
            None => self.report(
                SYNTAX_ERROR,
                node,
                "Syntax error: import without a module".to_string(),
            ),
        }

        let mut cursor = node.walk();
        let children: Vec<Node<'_>> = node.named_children(&mut cursor).collect();
        if let Some(wildcard) = children.iter().find(|c| c.kind() == "wildcard_import") {
            self.report(
                IMPORT_NOT_ALLOWED,
                *wildcard,
                "Wildcard imports are not allowed".to_string(),
            );
        }

        let mut cursor = node.walk();
        let names: Vec<Node<'_>> = node.children_by_field_name("name", &mut cursor).collect();
        for name in names {
            if name.kind() == "aliased_import" {
                if let Some(imported) = name.child_by_field_name("name") {
                    self.check_bound_name(imported);
                }
                if let Some(alias) = name.child_by_field_name("alias") {
                    self.check_bound_name(alias);
                }
            } else {
                self.check_bound_name(name);
            }
        }
    }

    fn check_identifier(&mut self, node: Node<'_>) {
        let name = self.text(node);
        if is_banned_builtin(name) {
            self.report(
                BANNED_BUILTIN,
                node,
                format!("Reference to banned builtin `{}`", name),
            );
        } else if is_dunder(name) {
            self.report(
                DUNDER_NAME,
                node,
                format!("Double-underscore name `{}` is not allowed", name),
            );
        }
    }

    fn check_attribute(&mut self, node: Node<'_>) {
        if let Some(object) = node.child_by_field_name("object") {
            if object.kind() == "identifier" {
                let root = self.text(object);
                if is_restricted_namespace(root) {
                    self.report(
                        RESTRICTED_NAMESPACE,
                        object,
                        format!("Access to restricted namespace `{}`", root),
                    );
                }
            }
        }

        let Some(attribute) = node.child_by_field_name("attribute") else {
            return;
        };
        let name = self.text(attribute);

        if is_dunder(name) {
            self.report(
                DUNDER_ATTRIBUTE,
                attribute,
                format!("Double-underscore attribute `{}` is not allowed", name),
            );
        } else if is_restricted_namespace(name) {
            self.report(
                RESTRICTED_NAMESPACE,
                attribute,
                format!("Access to restricted namespace `{}`", name),
            );
        } else if CODEGEN_ATTRIBUTES.contains(&name) {
            self.report(
                CODE_GENERATION,
                attribute,
                format!("Method `.{}` evaluates generated code", name),
            );
        } else if is_io_attribute(name) {
            self.report(
                FILESYSTEM_IO,
                attribute,
                format!("Method `.{}` touches the filesystem", name),
            );
        }
    }

    fn check_call(&mut self, node: Node<'_>) {
        let Some(function) = node.child_by_field_name("function") else {
            return;
        };
        let arguments: Vec<Node<'_>> = node
            .child_by_field_name("arguments")
            .map(|args| {
                let mut cursor = args.walk();
                let named: Vec<Node<'_>> = args
                    .named_children(&mut cursor)
                    .filter(|arg| arg.kind() != "comment")
                    .collect();
                named
            })
            .unwrap_or_default();

        match function.kind() {
            "identifier" if self.text(function) == "type" && arguments.len() == 3 => {
                self.report(
                    CODE_GENERATION,
                    node,
                    "Three-argument `type(...)` constructs classes dynamically".to_string(),
                );
            }
            "attribute" => self.check_writer_call(function, &arguments),
            _ => {}
        }
    }

    /// `to_*` calls write a file when handed a target.
    fn check_writer_call(&mut self, function: Node<'_>, arguments: &[Node<'_>]) {
        let Some(attribute) = function.child_by_field_name("attribute") else {
            return;
        };
        let name = self.text(attribute);
        if !name.starts_with("to_") || is_io_attribute(name) {
            return;
        }

        let text_writer = TEXT_WRITER_ATTRIBUTES.contains(&name);
        let has_target = arguments.iter().any(|arg| match arg.kind() {
            "keyword_argument" => arg
                .child_by_field_name("name")
                .map(|keyword| PATH_KEYWORDS.contains(&self.text(keyword)))
                .unwrap_or(false),
            "dictionary_splat" => true,
            _ => text_writer,
        });

        if has_target {
            self.report(
                FILESYSTEM_IO,
                attribute,
                format!("Method `.{}` with a file target touches the filesystem", name),
            );
        }
    }

    fn check_string(&mut self, node: Node<'_>) {
        let text = self.text(node);
        if let Some(marker) = DUNDER_STRING_MARKERS.iter().find(|m| text.contains(*m)) {
            self.report(
                DUNDER_STRING,
                node,
                format!("String literal names escape-vector attribute `{}`", marker),
            );
        }
    }
}

fn push_children<'t>(node: Node<'t>, stack: &mut Vec<Node<'t>>) {
    let mut cursor = node.walk();
    stack.extend(node.children(&mut cursor));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> AnalysisPolicy {
        AnalysisPolicy::new(["pandas", "numpy", "matplotlib", "mplsoccer", "math"])
    }

    fn ids(source: &str) -> Vec<String> {
        check(source, &policy())
            .unwrap()
            .into_iter()
            .map(|v| v.pattern_id)
            .collect()
    }

    #[test]
    fn test_parse_python() {
        let tree = parse_python("x = 1\n").unwrap();
        assert_eq!(tree.root_node().kind(), "module");
        assert!(!tree.root_node().has_error());
    }

    #[test]
    fn test_plotting_code_is_clean() {
        let source = r#"
import matplotlib.pyplot as plt
from mplsoccer import Pitch
import numpy as np

pitch = Pitch(pitch_type='statsbomb')
fig, ax = pitch.draw()
top = df.sort_values('goals', ascending=False).head(5)
ax.bar(top['player'], top['goals'], color='steelblue')
print(f"total {np.sum(top['goals'])}")
"#;
        assert!(ids(source).is_empty(), "{:?}", ids(source));
    }

    #[test]
    fn test_disallowed_import() {
        assert_eq!(ids("import requests"), vec![IMPORT_NOT_ALLOWED]);
        assert_eq!(ids("from os import path"), vec![IMPORT_NOT_ALLOWED]);
    }

    #[test]
    fn test_submodule_import_follows_parent() {
        assert!(ids("import matplotlib.pyplot as plt").is_empty());
        assert_eq!(ids("import matplotlibx"), vec![IMPORT_NOT_ALLOWED]);
    }

    #[test]
    fn test_relative_and_wildcard_imports() {
        assert_eq!(ids("from . import secrets"), vec![IMPORT_NOT_ALLOWED]);
        assert_eq!(ids("from mplsoccer import *"), vec![IMPORT_NOT_ALLOWED]);
    }

    #[test]
    fn test_imported_names_cannot_smuggle_restricted_modules() {
        assert_eq!(ids("from pandas import io as os"), vec![IMPORT_NOT_ALLOWED]);
        assert_eq!(ids("from numpy import __builtins__"), vec![IMPORT_NOT_ALLOWED]);
    }

    #[test]
    fn test_bare_builtin_reference_is_flagged() {
        assert_eq!(ids("f = eval"), vec![BANNED_BUILTIN]);
        assert_eq!(ids("getattr(df, 'x')"), vec![BANNED_BUILTIN]);
    }

    #[test]
    fn test_keyword_argument_names_are_not_references() {
        assert!(ids("plt.plot([1], input=1)").is_empty());
    }

    #[test]
    fn test_dunder_attribute_chain() {
        let found = ids("().__class__.__bases__[0].__subclasses__()");
        assert_eq!(
            found.iter().filter(|id| *id == DUNDER_ATTRIBUTE).count(),
            3
        );
    }

    #[test]
    fn test_restricted_namespace_anywhere_in_chain() {
        assert!(ids("np.os.system('ls')").contains(&RESTRICTED_NAMESPACE.to_string()));
        assert!(ids("os.path.join('a')").contains(&RESTRICTED_NAMESPACE.to_string()));
    }

    #[test]
    fn test_code_generation() {
        assert_eq!(ids("df.eval('a + b')"), vec![CODE_GENERATION]);
        assert_eq!(ids("top = df.query('goals > 1')"), vec![CODE_GENERATION]);
        assert_eq!(ids("T = type('T', (), {})"), vec![CODE_GENERATION]);
        assert!(ids("t = type(df)").is_empty());
    }

    #[test]
    fn test_filesystem_io_methods() {
        assert_eq!(ids("df.to_csv('out.csv')"), vec![FILESYSTEM_IO]);
        assert_eq!(ids("plt.savefig('x.png')"), vec![FILESYSTEM_IO]);
        assert_eq!(ids("img = plt.imread('/etc/hosts')"), vec![FILESYSTEM_IO]);
        assert_eq!(ids("x = pd.read_fwf('/etc/passwd')"), vec![FILESYSTEM_IO]);
        assert_eq!(ids("fig.canvas.print_png('x.png')"), vec![FILESYSTEM_IO]);
    }

    #[test]
    fn test_text_writers_need_a_target_to_be_io() {
        assert!(ids("print(df.to_string(index=False))").is_empty());
        assert!(ids("print(df.to_markdown())").is_empty());
        assert!(ids("dates = pd.to_datetime(df['date'])").is_empty());
        assert_eq!(ids("df.to_string('/tmp/out.txt')"), vec![FILESYSTEM_IO]);
        assert_eq!(ids("df.to_latex(buf='table.tex')"), vec![FILESYSTEM_IO]);
        assert_eq!(ids("df.to_markdown(**options)"), vec![FILESYSTEM_IO]);
        assert_eq!(ids("df.to_records(path='x')"), vec![FILESYSTEM_IO]);
    }

    #[test]
    fn test_dunder_string_inside_fstring_interpolation() {
        let found = ids("x = f\"{df['__class__']}\"");
        assert!(found.contains(&DUNDER_STRING.to_string()));
    }

    #[test]
    fn test_syntax_error_is_a_violation() {
        let found = ids("def broken(:\n    pass");
        assert!(found.contains(&SYNTAX_ERROR.to_string()));
    }

    #[test]
    fn test_deep_nesting_does_not_overflow() {
        let depth = 1000;
        let source = format!("x = {}1{}", "(".repeat(depth), ")".repeat(depth));
        assert!(check(&source, &policy()).is_ok());
    }

    #[test]
    fn test_all_violations_are_collected() {
        let source = "import os\nf = eval\nx = ().__class__\n";
        let found = ids(source);
        assert!(found.contains(&IMPORT_NOT_ALLOWED.to_string()));
        assert!(found.contains(&BANNED_BUILTIN.to_string()));
        assert!(found.contains(&DUNDER_ATTRIBUTE.to_string()));
    }
}
