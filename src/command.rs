//! Declarative command registry and argv parser.
//!
//! A command is registered with a primary spec string — the command
//! name followed by its positional arguments, e.g.
//! `"setex <string-key>"` — plus option specs such as `"[--mx]"`,
//! `"[--sec <int-sec>]"` or the repeatable `"[--ref <string-ref>]*"`,
//! each with help text. Write commands register through a separate
//! entry point that also records the name in the write set consulted
//! by the op-log.
//!
//! Parsed values mirror the raw request: string arguments resolve
//! through the `exact` (unescaped) view, while matching and numeric
//! parsing use the escaped text view.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;

use crate::client::{ClientRegistry, ClientState};
use crate::frame::RawRequest;
use crate::store_set::StoreSet;
use crate::value::ValueError;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("{0}")]
    Msg(String),
    #[error(transparent)]
    Value(#[from] ValueError),
}

impl CommandError {
    pub fn msg(text: impl Into<String>) -> Self {
        CommandError::Msg(text.into())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgType {
    Str,
    Int,
}

#[derive(Clone, Debug)]
pub struct ArgSpec {
    pub name: String,
    pub ty: ArgType,
}

#[derive(Clone, Debug)]
pub struct OptSpec {
    /// Flag name including the leading dashes, e.g. `--sec`.
    pub flag: String,
    /// Typed parameter that follows the flag, if any.
    pub param: Option<ArgSpec>,
    /// Whether the option may repeat, accumulating a list.
    pub repeatable: bool,
    pub help: String,
}

#[derive(Clone, Debug)]
pub enum ArgValue {
    Str { text: String, index: usize },
    Int(i64),
    Bool(bool),
    List(Vec<String>),
}

/// Parsed argument values, keyed the way the spec strings name them:
/// a positional `<string-key>` lands under `key`; an option `--sec`
/// sets `--sec` to true and its parameter under `sec`.
#[derive(Clone, Debug, Default)]
pub struct Values(HashMap<String, ArgValue>);

impl Values {
    pub fn flag(&self, name: &str) -> bool {
        matches!(self.0.get(name), Some(ArgValue::Bool(true)))
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        match self.0.get(name) {
            Some(ArgValue::Str { text, .. }) => Some(text),
            _ => None,
        }
    }

    /// Token index of a string argument, for pulling exact bytes out
    /// of the raw request.
    pub fn str_index(&self, name: &str) -> Option<usize> {
        match self.0.get(name) {
            Some(ArgValue::Str { index, .. }) => Some(*index),
            _ => None,
        }
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        match self.0.get(name) {
            Some(ArgValue::Int(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn list(&self, name: &str) -> &[String] {
        match self.0.get(name) {
            Some(ArgValue::List(items)) => items,
            _ => &[],
        }
    }

    fn insert(&mut self, name: String, value: ArgValue) {
        self.0.insert(name, value);
    }

    fn push_list(&mut self, name: &str, item: String) {
        match self.0.get_mut(name) {
            Some(ArgValue::List(items)) => items.push(item),
            _ => {
                self.0.insert(name.to_string(), ArgValue::List(vec![item]));
            }
        }
    }
}

/// Everything a handler needs for one dispatch.
pub struct CmdContext {
    pub response: serde_json::Map<String, serde_json::Value>,
    pub client: Arc<ClientState>,
    pub store_set: Arc<StoreSet>,
    pub clients: Arc<ClientRegistry>,
    pub values: Values,
    pub req: RawRequest,
    pub help: Vec<HelpEntry>,
}

impl CmdContext {
    /// Exact (unescaped) bytes of a string argument.
    pub fn exact_bytes(&self, name: &str) -> Option<&[u8]> {
        let index = self.values.str_index(name)?;
        self.req.exact.get(index).map(Vec::as_slice)
    }

    /// Record a mutation against the client's selected store.
    pub fn mark_dirty(&self, key: &str) {
        self.store_set.touch(&self.client.selected_db(), key);
    }

    pub fn set(&mut self, name: &str, value: impl Into<serde_json::Value>) {
        self.response.insert(name.to_string(), value.into());
    }
}

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), CommandError>> + Send + 'a>>;
pub type Handler = for<'a> fn(&'a mut CmdContext) -> HandlerFuture<'a>;

pub struct CommandDef {
    pub name: String,
    pub positionals: Vec<ArgSpec>,
    pub options: Vec<OptSpec>,
    pub help: String,
    pub handler: Handler,
}

#[derive(Clone, Debug)]
pub struct HelpEntry {
    pub command: String,
    pub help: String,
    pub options: Vec<String>,
}

#[derive(Default)]
pub struct CommandRegistry {
    commands: BTreeMap<String, CommandDef>,
    writes: HashSet<String>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a read-only command. `spec` is the primary spec
    /// string; `options` pairs option specs with their help text.
    pub fn register_command(
        &mut self,
        spec: &str,
        help: &str,
        options: &[(&str, &str)],
        handler: Handler,
    ) {
        let def = parse_command_spec(spec, help, options, handler);
        self.commands.insert(def.name.clone(), def);
    }

    /// Register a command that may mutate the store. The name joins
    /// the write set the dispatcher tags op-log records with.
    pub fn register_write_command(
        &mut self,
        spec: &str,
        help: &str,
        options: &[(&str, &str)],
        handler: Handler,
    ) {
        let def = parse_command_spec(spec, help, options, handler);
        self.writes.insert(def.name.clone());
        self.commands.insert(def.name.clone(), def);
    }

    pub fn get(&self, name: &str) -> Option<&CommandDef> {
        self.commands.get(name)
    }

    /// Whether the command was registered as potentially mutating.
    /// A coarse overapproximation: a failed write still reads as
    /// modifying.
    pub fn is_write_command(&self, name: &str) -> bool {
        self.writes.contains(name)
    }

    /// Help summary in command order.
    pub fn summary(&self) -> Vec<HelpEntry> {
        self.commands
            .values()
            .map(|def| {
                let mut command = def.name.clone();
                for arg in &def.positionals {
                    let ty = match arg.ty {
                        ArgType::Str => "string",
                        ArgType::Int => "int",
                    };
                    command.push_str(&format!(" <{}-{}>", ty, arg.name));
                }
                let mut options: Vec<String> = def
                    .options
                    .iter()
                    .map(|opt| format!("{}: {}", opt.flag, opt.help))
                    .collect();
                options.sort();
                HelpEntry { command, help: def.help.clone(), options }
            })
            .collect()
    }
}

/// Parse `"<type-name>"` into an [`ArgSpec`].
fn parse_arg_token(token: &str) -> ArgSpec {
    let inner = token.trim_start_matches('<').trim_end_matches('>');
    let (ty, name) = match inner.split_once('-') {
        Some(("int", name)) => (ArgType::Int, name),
        Some((_, name)) => (ArgType::Str, name),
        None => (ArgType::Str, inner),
    };
    ArgSpec { name: name.to_string(), ty }
}

fn parse_command_spec(
    spec: &str,
    help: &str,
    options: &[(&str, &str)],
    handler: Handler,
) -> CommandDef {
    let mut parts = spec.split_whitespace();
    let name = parts.next().unwrap_or_default().to_string();
    let positionals: Vec<ArgSpec> = parts.map(parse_arg_token).collect();

    let options = options
        .iter()
        .map(|(opt_spec, opt_help)| {
            let repeatable = opt_spec.ends_with('*');
            let inner = opt_spec
                .trim_end_matches('*')
                .trim_start_matches('[')
                .trim_end_matches(']');
            let mut tokens = inner.split_whitespace();
            let flag = tokens.next().unwrap_or_default().to_string();
            let param = tokens.next().map(parse_arg_token);
            OptSpec { flag, param, repeatable, help: (*opt_help).to_string() }
        })
        .collect();

    CommandDef { name, positionals, options, help: help.to_string(), handler }
}

/// Parse a raw request's argv against a command definition.
pub fn parse_argv(def: &CommandDef, req: &RawRequest) -> Result<Values, CommandError> {
    let mut values = Values::default();
    let mut next_positional = 0usize;
    let mut index = 1usize; // token 0 is the command name

    while index < req.args.len() {
        let token = &req.args[index];
        if let Some(opt) = def.options.iter().find(|o| o.flag == *token) {
            values.insert(opt.flag.clone(), ArgValue::Bool(true));
            if let Some(param) = &opt.param {
                index += 1;
                let Some(raw) = req.args.get(index) else {
                    return Err(CommandError::msg(format!(
                        "option {} requires a value",
                        opt.flag
                    )));
                };
                if opt.repeatable {
                    let text = String::from_utf8_lossy(&req.exact[index]).into_owned();
                    values.push_list(&param.name, text);
                } else {
                    values.insert(param.name.clone(), typed_value(param, raw, req, index)?);
                }
            }
            index += 1;
            continue;
        }
        if token.starts_with("--") {
            return Err(CommandError::msg(format!("unknown option {token}")));
        }
        let Some(spec) = def.positionals.get(next_positional) else {
            return Err(CommandError::msg(format!("unexpected argument {token}")));
        };
        values.insert(spec.name.clone(), typed_value(spec, token, req, index)?);
        next_positional += 1;
        index += 1;
    }

    if next_positional < def.positionals.len() {
        return Err(CommandError::msg(format!(
            "missing argument <{}>",
            def.positionals[next_positional].name
        )));
    }
    Ok(values)
}

fn typed_value(
    spec: &ArgSpec,
    raw: &str,
    req: &RawRequest,
    index: usize,
) -> Result<ArgValue, CommandError> {
    match spec.ty {
        ArgType::Int => raw
            .parse::<i64>()
            .map(ArgValue::Int)
            .map_err(|_| CommandError::msg(format!("invalid value for <{}>", spec.name))),
        ArgType::Str => Ok(ArgValue::Str {
            text: String::from_utf8_lossy(&req.exact[index]).into_owned(),
            index,
        }),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_ctx: &mut CmdContext) -> HandlerFuture<'_> {
        Box::pin(async { Ok(()) })
    }

    fn req(tokens: &[&str]) -> RawRequest {
        RawRequest::from_tokens(tokens.iter().map(|t| t.as_bytes()))
    }

    fn test_def() -> CommandDef {
        parse_command_spec(
            "setex <string-key>",
            "Sets a key value with options",
            &[
                ("[--mx]", "must exist"),
                ("[--sec <int-sec>]", "TTL seconds"),
                ("[--value <string-value>]", "the value"),
                ("[--ref <string-ref>]*", "reference keys"),
            ],
            noop,
        )
    }

    #[test]
    fn spec_string_parses_name_and_positionals() {
        let def = parse_command_spec("mv <string-src> <string-dest>", "", &[], noop);
        assert_eq!(def.name, "mv");
        assert_eq!(def.positionals.len(), 2);
        assert_eq!(def.positionals[0].name, "src");
        assert_eq!(def.positionals[1].ty, ArgType::Str);
    }

    #[test]
    fn positional_and_flags_parse() {
        let def = test_def();
        let values =
            parse_argv(&def, &req(&["setex", "/k", "--mx", "--sec", "5"])).unwrap();
        assert_eq!(values.str("key"), Some("/k"));
        assert!(values.flag("--mx"));
        assert!(values.flag("--sec"));
        assert_eq!(values.int("sec"), Some(5));
        assert!(!values.flag("--nx"));
    }

    #[test]
    fn repeatable_option_accumulates() {
        let def = test_def();
        let values = parse_argv(
            &def,
            &req(&["setex", "/k", "--ref", "/a", "--ref", "/b"]),
        )
        .unwrap();
        assert_eq!(values.list("ref"), &["/a", "/b"]);
    }

    #[test]
    fn missing_positional_is_an_error() {
        let def = test_def();
        let err = parse_argv(&def, &req(&["setex"])).unwrap_err();
        assert_eq!(err.to_string(), "missing argument <key>");
    }

    #[test]
    fn unknown_option_is_an_error() {
        let def = test_def();
        let err = parse_argv(&def, &req(&["setex", "/k", "--bogus"])).unwrap_err();
        assert_eq!(err.to_string(), "unknown option --bogus");
    }

    #[test]
    fn extra_positional_is_an_error() {
        let def = test_def();
        let err = parse_argv(&def, &req(&["setex", "/k", "stray"])).unwrap_err();
        assert_eq!(err.to_string(), "unexpected argument stray");
    }

    #[test]
    fn bad_int_is_an_error() {
        let def = test_def();
        let err = parse_argv(&def, &req(&["setex", "/k", "--sec", "soon"])).unwrap_err();
        assert_eq!(err.to_string(), "invalid value for <sec>");
    }

    #[test]
    fn option_missing_value_is_an_error() {
        let def = test_def();
        let err = parse_argv(&def, &req(&["setex", "/k", "--sec"])).unwrap_err();
        assert_eq!(err.to_string(), "option --sec requires a value");
    }

    #[test]
    fn string_values_resolve_exact_bytes() {
        let def = parse_command_spec("setv <string-key> <string-value>", "", &[], noop);
        // "\00" in the escaped view is a NUL byte in the exact view
        let request = req(&["setv", "/k", "\\00"]);
        let values = parse_argv(&def, &request).unwrap();
        assert_eq!(values.str_index("value"), Some(2));
        assert_eq!(request.exact[2], vec![0u8]);
    }

    #[test]
    fn write_set_membership() {
        let mut registry = CommandRegistry::new();
        registry.register_command("getk <string-key>", "", &[], noop);
        registry.register_write_command("setk <string-key>", "", &[], noop);
        assert!(registry.is_write_command("setk"));
        assert!(!registry.is_write_command("getk"));
    }

    #[test]
    fn summary_lists_commands_in_order() {
        let mut registry = CommandRegistry::new();
        registry.register_write_command("setk <string-key>", "Sets a key", &[], noop);
        registry.register_command(
            "lsk <string-pattern>",
            "Lists keys",
            &[("[--limit <int-limit>]", "max results")],
            noop,
        );
        let summary = registry.summary();
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].command, "lsk <string-pattern>");
        assert_eq!(summary[0].options, vec!["--limit: max results"]);
        assert_eq!(summary[1].command, "setk <string-key>");
    }
}
