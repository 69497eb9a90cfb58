//! Trusted Python harness executed inside every run unit
//!
//! The harness reads the run payload from stdin, builds a fresh globals dict
//! holding only the granted bindings and a minimal builtin table, runs the
//! submission and writes exactly one result envelope line to the real stdout:
//! `RESULT_MARKER` followed by compact JSON.
//!
//! Envelope schema:
//!
//! ```text
//! {"status": "ok" | "error" | "memory_exceeded" | "setup_error",
//!  "stdout": str, "figures": [base64 png], "figures_dropped": int,
//!  "error": null | {"type": str, "message": str, "line": int | null}}
//! ```

/// Prefix of the result envelope line.
pub const RESULT_MARKER: &str = "__SCOUTBOX_RESULT__:";

/// Filename the submission is compiled under; used to locate error lines.
pub const SUBMISSION_FILENAME: &str = "<submission>";

/// Interpreter flags: no user site-packages, no bytecode writes.
///
/// `-I` would also ignore `PYTHONHASHSEED`; the runner clears the
/// environment instead so the fixed hash seed still applies.
pub const INTERPRETER_ARGS: &[&str] = &["-s", "-B", "-c"];

/// Source of the harness, passed with `-c`.
pub const HARNESS_SOURCE: &str = r#"
import base64
import builtins
import importlib
import io
import json
import sys
import types

MARKER = "__SCOUTBOX_RESULT__:"
FILENAME = "<submission>"
REAL_STDOUT = sys.stdout
MAX_MESSAGE = 2000

SAFE_BUILTINS = (
    "abs", "all", "any", "ascii", "bin", "bool", "callable", "chr", "dict",
    "divmod", "enumerate", "filter", "float", "format", "frozenset", "hash",
    "hex", "int", "isinstance", "issubclass", "iter", "len", "list", "map",
    "max", "min", "next", "oct", "ord", "pow", "range", "repr", "reversed",
    "round", "set", "slice", "sorted", "str", "sum", "tuple", "type", "zip",
    "ArithmeticError", "AssertionError", "AttributeError", "Exception",
    "IndexError", "KeyError", "LookupError", "NameError", "NotImplementedError",
    "OverflowError", "RuntimeError", "StopIteration", "TypeError",
    "ValueError", "ZeroDivisionError",
)


def emit(envelope):
    REAL_STDOUT.write(MARKER + json.dumps(envelope, separators=(",", ":")) + "\n")
    REAL_STDOUT.flush()


def failure(status, exc, line=None):
    return {
        "status": status,
        "stdout": "",
        "figures": [],
        "figures_dropped": 0,
        "error": {"type": type(exc).__name__, "message": str(exc)[:MAX_MESSAGE], "line": line},
    }


def submission_line(exc):
    if isinstance(exc, SyntaxError) and exc.filename == FILENAME:
        return exc.lineno
    line = None
    tb = exc.__traceback__
    while tb is not None:
        if tb.tb_frame.f_code.co_filename == FILENAME:
            line = tb.tb_lineno
        tb = tb.tb_next
    return line


def guarded_import(allowed):
    real_import = builtins.__import__

    def _import(name, globals=None, locals=None, fromlist=(), level=0):
        if level != 0:
            raise ImportError("relative imports are not available")
        if not any(name == m or name.startswith(m + ".") for m in allowed):
            raise ImportError("import of '%s' is not allowed" % name)
        return real_import(name, globals, locals, fromlist, level)

    return _import


READ_ONLY = "the dataset is read-only; work on a copy instead"


def read_only(*args, **kwargs):
    raise TypeError(READ_ONLY)


class ReadOnlyIndexer:
    __slots__ = ("_indexer",)

    def __init__(self, indexer):
        object.__setattr__(self, "_indexer", indexer)

    def __getitem__(self, key):
        return self._indexer[key]

    __setitem__ = read_only
    __delitem__ = read_only
    __setattr__ = read_only


def frozen_frame(pandas, columns, rows):
    frame = pandas.DataFrame(rows, columns=columns)
    for values in getattr(getattr(frame, "_mgr", None), "arrays", ()):
        flags = getattr(values, "flags", None)
        if flags is not None:
            flags.writeable = False

    def indexer(name):
        base = getattr(pandas.DataFrame, name)
        return property(lambda self: ReadOnlyIndexer(base.fget(self)))

    def guarded_setattr(self, name, value):
        if not name.startswith("_"):
            raise TypeError(READ_ONLY)
        pandas.DataFrame.__setattr__(self, name, value)

    namespace = {
        "_constructor": property(lambda self: pandas.DataFrame),
        "__setitem__": read_only,
        "__delitem__": read_only,
        "__setattr__": guarded_setattr,
        "_update_inplace": read_only,
        "insert": read_only,
        "pop": read_only,
        "update": read_only,
        "loc": indexer("loc"),
        "iloc": indexer("iloc"),
        "at": indexer("at"),
        "iat": indexer("iat"),
    }
    frozen = type("ReadOnlyDataFrame", (pandas.DataFrame,), namespace)
    return frozen(frame)


def dataset_view(dataset, want_frame):
    columns = dataset["columns"]
    rows = dataset["rows"]
    if want_frame:
        try:
            import pandas
        except ImportError:
            pass
        else:
            return frozen_frame(pandas, columns, rows)
    return types.MappingProxyType(
        {name: tuple(row[i] for row in rows) for i, name in enumerate(columns)}
    )


def build_scope(payload):
    allowed = tuple(payload["allowed_modules"])
    if any(m == "matplotlib" for m in allowed):
        import matplotlib
        matplotlib.use("Agg")

    safe = {name: getattr(builtins, name) for name in SAFE_BUILTINS if hasattr(builtins, name)}
    safe["__import__"] = guarded_import(allowed)
    scope = {"__builtins__": safe, "__name__": "__submission__"}

    names = {b["name"] for b in payload["bindings"]}
    for binding in payload["bindings"]:
        kind = binding["kind"]
        if kind == "dataset":
            value = dataset_view(payload["dataset"], "pd" in names)
        elif kind == "module":
            value = importlib.import_module(binding["module"])
        elif kind == "member":
            value = getattr(importlib.import_module(binding["module"]), binding["member"])
        elif kind == "builtin":
            value = getattr(builtins, binding["builtin"])
        else:
            raise ValueError("unknown binding kind %r" % kind)
        scope[binding["name"]] = value
    return scope


def render_figures(capture):
    plt = sys.modules.get("matplotlib.pyplot")
    if plt is None:
        return [], 0
    numbers = plt.get_fignums()
    kept = numbers[: capture["max_figures"]]
    figures = []
    for number in kept:
        figure = plt.figure(number)
        buffer = io.BytesIO()
        figure.savefig(
            buffer,
            format="png",
            dpi=capture["dpi"],
            bbox_inches="tight",
            metadata={"Software": None},
        )
        figures.append(base64.b64encode(buffer.getvalue()).decode("ascii"))
    plt.close("all")
    return figures, len(numbers) - len(kept)


def clip(text, limit):
    encoded = text.encode("utf-8", "replace")
    if len(encoded) <= limit:
        return text
    head = encoded[:limit].decode("utf-8", "ignore")
    return "%s\n... [output truncated at %d bytes]" % (head, limit)


def main():
    try:
        payload = json.loads(sys.stdin.read())
        capture = payload["capture"]
        scope = build_scope(payload)
    except MemoryError as exc:
        emit(failure("memory_exceeded", exc))
        return
    except BaseException as exc:
        emit(failure("setup_error", exc))
        return

    printed = io.StringIO()
    status, error = "ok", None
    try:
        code = compile(payload["source"], FILENAME, "exec")
        sys.stdout = printed
        try:
            exec(code, scope)
        finally:
            sys.stdout = REAL_STDOUT
    except MemoryError as exc:
        status = "memory_exceeded"
        error = {"type": "MemoryError", "message": "memory limit exceeded", "line": submission_line(exc)}
    except BaseException as exc:
        status = "error"
        error = {"type": type(exc).__name__, "message": str(exc)[:MAX_MESSAGE], "line": submission_line(exc)}

    figures, dropped = [], 0
    if status == "ok":
        try:
            figures, dropped = render_figures(capture)
        except MemoryError as exc:
            status = "memory_exceeded"
            error = {"type": "MemoryError", "message": "memory limit exceeded while rendering", "line": None}
        except BaseException as exc:
            status = "error"
            error = {"type": type(exc).__name__, "message": str(exc)[:MAX_MESSAGE], "line": None}

    emit({
        "status": status,
        "stdout": clip(printed.getvalue(), capture["max_text_bytes"]),
        "figures": figures,
        "figures_dropped": dropped,
        "error": error,
    })


main()
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_is_embedded_in_harness() {
        assert!(HARNESS_SOURCE.contains(&format!("MARKER = \"{}\"", RESULT_MARKER)));
        assert!(HARNESS_SOURCE.contains(&format!("FILENAME = \"{}\"", SUBMISSION_FILENAME)));
    }

    #[test]
    fn test_harness_withholds_dangerous_builtins() {
        let start = HARNESS_SOURCE.find("SAFE_BUILTINS = (").unwrap();
        let end = start + HARNESS_SOURCE[start..].find(')').unwrap();
        let table = &HARNESS_SOURCE[start..end];
        for banned in ["\"open\"", "\"eval\"", "\"exec\"", "\"compile\"", "\"getattr\"", "\"globals\"", "\"__build_class__\"", "\"print\""] {
            assert!(!table.contains(banned), "{} must not be a safe builtin", banned);
        }
    }

    #[test]
    fn test_harness_parses_as_python() {
        let policy = analyzer::AnalysisPolicy::default().with_max_source_len(usize::MAX);
        let tree = analyzer::structural::parse_python(HARNESS_SOURCE).unwrap();
        assert!(!tree.root_node().has_error());
        assert!(!analyzer::analyze(HARNESS_SOURCE, &policy).allowed);
    }
}
