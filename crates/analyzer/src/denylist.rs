//! The versioned denylist enforced by both analyzer layers.
//!
//! Any change to a table in this module must bump [`DENYLIST_VERSION`] so that
//! verdicts can be traced back to the rules that produced them.

/// Version stamped on every [`SafetyVerdict`](crate::SafetyVerdict).
pub const DENYLIST_VERSION: &str = "2026.10.2";

/// A regex rule of the textual pre-filter.
#[derive(Debug, Clone, Copy)]
pub struct TextRule {
    pub id: &'static str,
    pub pattern: &'static str,
    pub message: &'static str,
}

/// Built-in pre-filter rules. Matched line by line.
pub const TEXT_RULES: &[TextRule] = &[
    TextRule {
        id: "text:import-os",
        pattern: r"\b(import|from)\s+os\b",
        message: "Importing `os` exposes the host filesystem and processes",
    },
    TextRule {
        id: "text:import-sys",
        pattern: r"\b(import|from)\s+sys\b",
        message: "Importing `sys` exposes interpreter internals",
    },
    TextRule {
        id: "text:subprocess",
        pattern: r"\bsubprocess\b",
        message: "Process creation is not available in the sandbox",
    },
    TextRule {
        id: "text:socket",
        pattern: r"\bsocket\b",
        message: "Network sockets are not available in the sandbox",
    },
    TextRule {
        id: "text:network",
        pattern: r"\b(urllib|requests|httpx|ftplib|smtplib|telnetlib|http\.client)\b",
        message: "Network clients are not available in the sandbox",
    },
    TextRule {
        id: "text:shutil",
        pattern: r"\bshutil\b",
        message: "Filesystem manipulation is not available in the sandbox",
    },
    TextRule {
        id: "text:ctypes",
        pattern: r"\b(ctypes|cffi)\b",
        message: "Foreign function interfaces are not available in the sandbox",
    },
    TextRule {
        id: "text:serialization",
        pattern: r"\b(c?pickle|marshal|shelve|dill)\b",
        message: "Object deserialization can execute arbitrary code",
    },
    TextRule {
        id: "text:importlib",
        pattern: r"\bimportlib\b",
        message: "Dynamic imports are not allowed",
    },
    TextRule {
        id: "text:dunder-import",
        pattern: r"__import__",
        message: "Dynamic imports are not allowed",
    },
    TextRule {
        id: "text:eval-call",
        pattern: r"\beval\s*\(",
        message: "`eval` executes generated code",
    },
    TextRule {
        id: "text:exec-call",
        pattern: r"\bexec\s*\(",
        message: "`exec` executes generated code",
    },
    TextRule {
        id: "text:compile-call",
        pattern: r"\bcompile\s*\(",
        message: "`compile` generates code objects",
    },
    TextRule {
        id: "text:open-call",
        pattern: r"(?:^|[^\w.])open\s*\(",
        message: "Opening files is not allowed",
    },
    TextRule {
        id: "text:input-call",
        pattern: r"(?:^|[^\w.])input\s*\(",
        message: "Interactive input is not available in the sandbox",
    },
    TextRule {
        id: "text:reflection",
        pattern: r"\b(globals|locals|vars|getattr|setattr|delattr)\s*\(",
        message: "Reflective access to namespaces and attributes is not allowed",
    },
    TextRule {
        id: "text:breakpoint",
        pattern: r"\bbreakpoint\s*\(",
        message: "Debugger hooks are not available in the sandbox",
    },
    TextRule {
        id: "text:dunder-escape",
        pattern: r"__(class|bases|base|subclasses|globals|builtins|mro|code|closure|loader|spec|dict|getattribute|reduce|reduce_ex)__",
        message: "Dunder attributes are a common sandbox escape vector",
    },
    TextRule {
        id: "text:os-call",
        pattern: r"\bos\s*\.\s*(system|popen|exec\w*|spawn\w*|fork|kill|remove|unlink|rmdir|environ|getenv)\b",
        message: "Operating-system calls are not available in the sandbox",
    },
    TextRule {
        id: "text:dataframe-io",
        pattern: r"\b(read|to)_(csv|excel|json|pickle|parquet|table|fwf|html|xml|sql\w*|hdf|feather|orc|stata|sas|spss|clipboard)\s*\(",
        message: "Reading or writing files through pandas is not allowed",
    },
    TextRule {
        id: "text:numpy-io",
        pattern: r"\b(np|numpy)\s*\.\s*(load|save\w*|fromfile|fromregex|loadtxt|genfromtxt|memmap|DataSource)\b|\.tofile\s*\(",
        message: "Reading or writing files through numpy is not allowed",
    },
    TextRule {
        id: "text:image-io",
        pattern: r"\b(imsave|imread)\s*\(",
        message: "Reading or writing image files is not allowed",
    },
    TextRule {
        id: "text:savefig",
        pattern: r"\bsavefig\s*\(",
        message: "Figures are captured automatically; writing them to disk is not allowed",
    },
];

/// Builtins that may not even be referenced by name.
pub const BANNED_BUILTINS: &[&str] = &[
    "eval",
    "exec",
    "compile",
    "__import__",
    "open",
    "globals",
    "locals",
    "vars",
    "getattr",
    "setattr",
    "delattr",
    "breakpoint",
    "input",
    "memoryview",
    "help",
    "exit",
    "quit",
];

/// Modules that may not appear anywhere in an attribute chain or import.
pub const RESTRICTED_NAMESPACES: &[&str] = &[
    "os",
    "sys",
    "subprocess",
    "socket",
    "shutil",
    "ctypes",
    "pickle",
    "marshal",
    "importlib",
    "builtins",
    "pathlib",
    "tempfile",
    "multiprocessing",
    "threading",
    "pty",
    "posix",
    "nt",
    "inspect",
    "runpy",
    "urllib",
    "requests",
];

/// Attribute names that evaluate or generate code when called.
pub const CODEGEN_ATTRIBUTES: &[&str] = &[
    "eval",
    "exec",
    "compile",
    "query",
    "system",
    "popen",
    "load_module",
    "exec_module",
];

/// Attribute names that read from or write to the filesystem whenever called.
pub const IO_ATTRIBUTES: &[&str] = &[
    "to_excel",
    "to_pickle",
    "to_parquet",
    "to_sql",
    "to_hdf",
    "to_feather",
    "to_orc",
    "to_stata",
    "to_clipboard",
    "savefig",
    "print_figure",
    "imsave",
    "imread",
    "rc_file",
    "load",
    "save",
    "savez",
    "savez_compressed",
    "savetxt",
    "fromfile",
    "fromregex",
    "tofile",
    "loadtxt",
    "genfromtxt",
    "memmap",
    "open_memmap",
    "DataSource",
    "HDFStore",
    "ExcelFile",
    "ExcelWriter",
    "open",
];

/// Attribute prefixes that always denote file access (`pd.read_csv`,
/// `canvas.print_png`).
pub const IO_ATTRIBUTE_PREFIXES: &[&str] = &["read_", "print_"];

/// Writers that return text when called bare and write a file when handed a
/// target. `df.to_string()` is fine, `df.to_string('/tmp/x')` is not.
pub const TEXT_WRITER_ATTRIBUTES: &[&str] = &[
    "to_csv",
    "to_json",
    "to_html",
    "to_xml",
    "to_string",
    "to_markdown",
    "to_latex",
];

/// Keyword arguments that name a file target on any `to_*` call.
pub const PATH_KEYWORDS: &[&str] = &[
    "buf",
    "path",
    "path_or_buf",
    "path_or_buffer",
    "excel_writer",
    "fname",
    "file",
    "filename",
    "filepath",
];

pub fn is_io_attribute(name: &str) -> bool {
    IO_ATTRIBUTES.contains(&name)
        || IO_ATTRIBUTE_PREFIXES
            .iter()
            .any(|prefix| name.starts_with(prefix) && name.len() > prefix.len())
}

/// Dunder names whose appearance inside a string literal is treated as an
/// obfuscated attribute lookup.
pub const DUNDER_STRING_MARKERS: &[&str] = &[
    "__class__",
    "__bases__",
    "__base__",
    "__subclasses__",
    "__globals__",
    "__builtins__",
    "__import__",
    "__code__",
    "__mro__",
    "__dict__",
    "__getattribute__",
    "__reduce__",
    "__reduce_ex__",
    "__loader__",
    "__spec__",
    "__closure__",
    "__func__",
    "__self__",
];

pub fn is_banned_builtin(name: &str) -> bool {
    BANNED_BUILTINS.contains(&name)
}

pub fn is_restricted_namespace(name: &str) -> bool {
    RESTRICTED_NAMESPACES.contains(&name)
}

/// `__name__`-shaped identifiers.
pub fn is_dunder(name: &str) -> bool {
    name.len() > 4 && name.starts_with("__") && name.ends_with("__")
}
