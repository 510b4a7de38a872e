//! Embedded Python VM used by `run_code`.
//!
//! Every call builds a brand new interpreter, so nothing a snippet defines can
//! leak into the next one. Host state the snippet needs (subject id, data
//! handle, output buffers) lives in thread-locals that are reset around each
//! execution; the blocking task that runs a snippet owns its thread for the
//! duration.

use std::cell::RefCell;
use std::sync::Arc;

use chrono::NaiveDate;
use rustpython_compiler::Mode;
use rustpython_vm::builtins::{PyDict, PyModule};
use rustpython_vm::function::FuncArgs;
use rustpython_vm::{
    AsObject, Interpreter, PyObject, PyObjectRef, PyPayload, PyRef, PyResult, Settings, VirtualMachine,
};
use serde_json::Value;

use super::SandboxExecutionResult;
use crate::insight::collaborators::{DataAccess, DateRange};

thread_local! {
    static STDOUT_BUFFER: RefCell<String> = RefCell::new(String::new());
    static STDERR_BUFFER: RefCell<String> = RefCell::new(String::new());
    static SUBJECT_ID: RefCell<String> = RefCell::new(String::new());
    static DATA_ACCESS: RefCell<Option<Arc<dyn DataAccess>>> = RefCell::new(None);
}

pub const ALLOWED_MODULES: &[&str] = &[
    "math", "json", "datetime", "time", "re", "collections", "itertools", "functools",
    "operator", "string", "statistics", "decimal", "fractions", "random", "copy", "typing",
    "calendar", "bisect", "heapq",
];

/// Removed from `builtins` outright.
pub const BLOCKED_BUILTINS: &[&str] = &[
    "open", "input", "breakpoint", "globals", "locals", "vars", "exit", "quit", "help",
];

/// Stay callable from library code (importlib, `namedtuple`, `_strptime`)
/// but raise `NameError` when called from the snippet itself.
pub const GUARDED_BUILTINS: &[&str] = &["eval", "exec", "compile"];

const SANDBOX_MODULE: &str = "_sandbox";

/// Prepares the namespace the snippet runs in. Runs as `__sandbox_setup__`
/// so its own imports bypass the allow-list; the last step renames the
/// namespace to `__sandbox__` and installs the restricted importer.
const SETUP_CODE: &str = r#"
__name__ = '__sandbox_setup__'

import builtins as _builtins
import sys as _sys
import json
import math
from datetime import date, datetime, timedelta, timezone
from _sandbox import write_stdout as _write_stdout, write_stderr as _write_stderr
from _sandbox import subject_id as _subject_id, query_table as _query_table, list_tables as _list_tables

class _Capture:
    def __init__(self, sink):
        self._sink = sink
    def write(self, text):
        text = str(text)
        self._sink(text)
        return len(text)
    def flush(self):
        pass
    def isatty(self):
        return False

_sys.stdout = _Capture(_write_stdout)
_sys.stderr = _Capture(_write_stderr)
stderr = _sys.stderr

def get_user_id():
    return _subject_id()

def _date_text(value):
    if value is None:
        return None
    if hasattr(value, 'isoformat'):
        return value.isoformat()
    return str(value)

class _Loader:
    def tables(self):
        return _list_tables()
    def query(self, table, start_date=None, end_date=None):
        return _query_table(str(table), _date_text(start_date), _date_text(end_date))
    def __getattr__(self, name):
        if not name.startswith('get_'):
            raise AttributeError(name)
        table = name[4:]
        if table.endswith('_df'):
            table = table[:-3]
        def _getter(start_date=None, end_date=None, **_scope):
            return self.query(table, start_date, end_date)
        return _getter

loader = _Loader()

for _module in __BLOCKED_MODULES__:
    _sys.modules.pop(_module, None)

_allowed_modules = frozenset(__ALLOWED_MODULES__)
_original_import = _builtins.__import__

def _restricted_import(name, globals=None, locals=None, fromlist=(), level=0):
    caller = globals.get('__name__') if isinstance(globals, dict) else None
    if caller is None or caller == '__sandbox__':
        if level != 0 or name.split('.')[0] not in _allowed_modules:
            raise ImportError("Import '" + name + "' is not allowed in the sandbox")
    return _original_import(name, globals, locals, fromlist, level)

def _sandbox_guard(name, original, _getframe=_sys._getframe):
    def _guarded(*args, **kwargs):
        caller = _getframe(1).f_globals.get('__name__')
        if caller is None or caller == '__sandbox__':
            raise NameError("name '" + name + "' is not defined")
        return original(*args, **kwargs)
    _guarded.__name__ = name
    return _guarded

for _name in __BLOCKED_BUILTINS__:
    if hasattr(_builtins, _name):
        delattr(_builtins, _name)

for _name in __GUARDED_BUILTINS__:
    if hasattr(_builtins, _name):
        setattr(_builtins, _name, _sandbox_guard(_name, getattr(_builtins, _name)))

_builtins.__import__ = _restricted_import

del _module, _name, _builtins, _sys, _sandbox_guard
__name__ = '__sandbox__'
"#;

const BLOCKED_MODULES: &[&str] = &[
    "os", "posix", "nt", "io", "_io", "subprocess", "socket", "_socket", "shutil", "pathlib",
];

fn python_list(items: &[&str]) -> String {
    let quoted: Vec<String> = items.iter().map(|item| format!("'{item}'")).collect();
    format!("[{}]", quoted.join(", "))
}

fn setup_source() -> String {
    SETUP_CODE
        .replace("__BLOCKED_MODULES__", &python_list(BLOCKED_MODULES))
        .replace("__ALLOWED_MODULES__", &python_list(ALLOWED_MODULES))
        .replace("__BLOCKED_BUILTINS__", &python_list(BLOCKED_BUILTINS))
        .replace("__GUARDED_BUILTINS__", &python_list(GUARDED_BUILTINS))
}

fn reset_execution_state(subject_id: &str, data: Option<Arc<dyn DataAccess>>) {
    STDOUT_BUFFER.with(|b| b.borrow_mut().clear());
    STDERR_BUFFER.with(|b| b.borrow_mut().clear());
    SUBJECT_ID.with(|s| *s.borrow_mut() = subject_id.to_string());
    DATA_ACCESS.with(|d| *d.borrow_mut() = data);
}

fn take_output() -> (String, String) {
    let stdout = STDOUT_BUFFER.with(|b| std::mem::take(&mut *b.borrow_mut()));
    let stderr = STDERR_BUFFER.with(|b| std::mem::take(&mut *b.borrow_mut()));
    (stdout, stderr)
}

fn create_interpreter() -> Interpreter {
    let mut settings = Settings::default();
    settings.isolated = true;
    settings.user_site_directory = false;
    settings.import_site = false;

    Interpreter::with_init(settings, |vm| {
        vm.add_native_modules(rustpython_stdlib::get_module_inits());
        vm.add_frozen(rustpython_pylib::FROZEN_STDLIB);
        vm.add_native_module(SANDBOX_MODULE.to_owned(), Box::new(make_sandbox_module));
    })
}

fn make_sandbox_module(vm: &VirtualMachine) -> PyRef<PyModule> {
    let module_ref = PyModule::new().into_ref(&vm.ctx);
    let dict = module_ref.dict();

    let _ = dict.set_item("write_stdout", vm.new_function("write_stdout", write_stdout_impl).into(), vm);
    let _ = dict.set_item("write_stderr", vm.new_function("write_stderr", write_stderr_impl).into(), vm);
    let _ = dict.set_item("subject_id", vm.new_function("subject_id", subject_id_impl).into(), vm);
    let _ = dict.set_item("query_table", vm.new_function("query_table", query_table_impl).into(), vm);
    let _ = dict.set_item("list_tables", vm.new_function("list_tables", list_tables_impl).into(), vm);

    module_ref
}

fn first_text(args: &FuncArgs, vm: &VirtualMachine) -> PyResult<String> {
    match args.args.first() {
        Some(obj) => Ok(obj.str(vm)?.to_string()),
        None => Ok(String::new()),
    }
}

fn write_stdout_impl(args: FuncArgs, vm: &VirtualMachine) -> PyResult<()> {
    let text = first_text(&args, vm)?;
    STDOUT_BUFFER.with(|b| b.borrow_mut().push_str(&text));
    Ok(())
}

fn write_stderr_impl(args: FuncArgs, vm: &VirtualMachine) -> PyResult<()> {
    let text = first_text(&args, vm)?;
    STDERR_BUFFER.with(|b| b.borrow_mut().push_str(&text));
    Ok(())
}

fn subject_id_impl(_args: FuncArgs, _vm: &VirtualMachine) -> PyResult<String> {
    Ok(SUBJECT_ID.with(|s| s.borrow().clone()))
}

fn data_handle(vm: &VirtualMachine) -> PyResult<Arc<dyn DataAccess>> {
    DATA_ACCESS
        .with(|d| d.borrow().clone())
        .ok_or_else(|| vm.new_runtime_error("No data source is attached to this sandbox".to_string()))
}

fn optional_date(arg: Option<&PyObjectRef>, label: &str, vm: &VirtualMachine) -> PyResult<Option<NaiveDate>> {
    let Some(obj) = arg else {
        return Ok(None);
    };
    if obj.is(&vm.ctx.none) {
        return Ok(None);
    }
    let text = obj.str(vm)?.to_string();
    let head = text.trim().get(..10).unwrap_or(text.trim()).to_string();
    NaiveDate::parse_from_str(&head, "%Y-%m-%d")
        .map(Some)
        .map_err(|_| vm.new_value_error(format!("{label} must be a YYYY-MM-DD date, got '{text}'")))
}

fn query_table_impl(args: FuncArgs, vm: &VirtualMachine) -> PyResult {
    let table: String = args
        .args
        .first()
        .ok_or_else(|| vm.new_type_error("query requires a table name".to_string()))?
        .try_to_value(vm)?;
    let start = optional_date(args.args.get(1), "start_date", vm)?;
    let end = optional_date(args.args.get(2), "end_date", vm)?;

    let data = data_handle(vm)?;
    let subject_id = SUBJECT_ID.with(|s| s.borrow().clone());
    let rows = data
        .query(&table, &subject_id, DateRange::new(start, end))
        .map_err(|e| vm.new_key_error(vm.ctx.new_str(e.to_string()).into()))?;

    let value = Value::Array(rows.into_iter().map(Value::Object).collect());
    json_to_pyobject(&value, vm)
}

fn list_tables_impl(_args: FuncArgs, vm: &VirtualMachine) -> PyResult {
    let data = data_handle(vm)?;
    let tables: Vec<Value> = data
        .tables()
        .into_iter()
        .map(|schema| {
            serde_json::json!({
                "name": schema.name,
                "columns": schema.columns,
                "date_column": schema.date_column,
            })
        })
        .collect();
    json_to_pyobject(&Value::Array(tables), vm)
}

pub fn json_to_pyobject(value: &Value, vm: &VirtualMachine) -> PyResult {
    match value {
        Value::Null => Ok(vm.ctx.none()),
        Value::Bool(b) => Ok(vm.ctx.new_bool(*b).into()),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(vm.ctx.new_int(i).into())
            } else if let Some(f) = n.as_f64() {
                Ok(vm.ctx.new_float(f).into())
            } else {
                Ok(vm.ctx.none())
            }
        }
        Value::String(s) => Ok(vm.ctx.new_str(s.clone()).into()),
        Value::Array(items) => {
            let items = items
                .iter()
                .map(|v| json_to_pyobject(v, vm))
                .collect::<PyResult<Vec<_>>>()?;
            Ok(vm.ctx.new_list(items).into())
        }
        Value::Object(map) => {
            let dict = PyDict::new_ref(&vm.ctx);
            for (k, v) in map {
                dict.set_item(k.as_str(), json_to_pyobject(v, vm)?, vm)?;
            }
            Ok(dict.into())
        }
    }
}

fn exception_parts(exc: &PyObject, vm: &VirtualMachine) -> (String, String) {
    let kind = exc.class().name().to_string();
    let message = exc
        .str(vm)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| "<unprintable exception>".to_string());
    (kind, message)
}

/// Runs `code` in a fresh interpreter on the current thread.
pub fn execute_snippet(code: &str, subject_id: &str, data: Option<Arc<dyn DataAccess>>) -> SandboxExecutionResult {
    reset_execution_state(subject_id, data);

    let interpreter = create_interpreter();
    let fault = interpreter.enter(|vm| -> Option<(String, String)> {
        let scope = vm.new_scope_with_builtins();

        let setup = match vm.compile(&setup_source(), Mode::Exec, "<sandbox_setup>".to_string()) {
            Ok(code) => code,
            Err(e) => return Some(("SandboxSetupError".to_string(), format!("{e}"))),
        };
        if let Err(exc) = vm.run_code_obj(setup, scope.clone()) {
            let (kind, message) = exception_parts(exc.as_object(), vm);
            return Some(("SandboxSetupError".to_string(), format!("{kind}: {message}")));
        }

        let user_code = match vm.compile(code, Mode::Exec, "<run_code>".to_string()) {
            Ok(code) => code,
            Err(e) => return Some(("SyntaxError".to_string(), format!("{e}"))),
        };

        match vm.run_code_obj(user_code, scope) {
            Ok(_) => None,
            Err(exc) => Some(exception_parts(exc.as_object(), vm)),
        }
    });
    drop(interpreter);

    let (stdout, stderr) = take_output();
    reset_execution_state("", None);

    match fault {
        None => SandboxExecutionResult::completed(stdout, stderr),
        Some((kind, message)) => SandboxExecutionResult::faulted(stdout, stderr, kind, message),
    }
}
