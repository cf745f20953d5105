use mage_splice::emit_marker;
use std::collections::HashMap;

/// Arguments for one block instance: named fields from the editor plus the
/// indentation the emitted code should carry.
#[derive(Debug, Clone, Default)]
pub struct BlockArgs {
    pub fields: HashMap<String, String>,
    pub indent: String,
}

impl BlockArgs {
    pub fn with_field(mut self, name: &str, value: &str) -> Self {
        self.fields.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_indent(mut self, indent: &str) -> Self {
        self.indent = indent.to_string();
        self
    }

    fn field(&self, name: &str) -> &str {
        self.fields.get(name).map(String::as_str).unwrap_or("")
    }
}

pub type EmitFn = fn(&BlockArgs) -> String;

/// Maps block-type tags to pure code-emission functions. Populated once at
/// startup; dispatch is a table lookup, not inheritance.
pub struct BlockRegistry {
    emitters: HashMap<&'static str, EmitFn>,
}

impl BlockRegistry {
    pub fn empty() -> Self {
        Self {
            emitters: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("say", emit_say);
        registry.register("set", emit_set);
        registry.register("repeat", emit_repeat);
        registry.register("magic", emit_magic);
        registry
    }

    pub fn register(&mut self, tag: &'static str, emit: EmitFn) {
        self.emitters.insert(tag, emit);
    }

    pub fn emit(&self, tag: &str, args: &BlockArgs) -> Option<String> {
        self.emitters.get(tag).map(|emit| emit(args))
    }

    pub fn tags(&self) -> Vec<&'static str> {
        let mut tags: Vec<_> = self.emitters.keys().copied().collect();
        tags.sort_unstable();
        tags
    }
}

fn emit_say(args: &BlockArgs) -> String {
    let text = args.field("text").replace('\'', "\\'");
    format!("{}console.log('{text}');\n", args.indent)
}

fn emit_set(args: &BlockArgs) -> String {
    format!(
        "{}let {} = {};\n",
        args.indent,
        args.field("name"),
        args.field("value")
    )
}

fn emit_repeat(args: &BlockArgs) -> String {
    format!(
        "{indent}for (let i = 0; i < {count}; i++) {{\n{body}{indent}}}\n",
        indent = args.indent,
        count = args.field("count"),
        body = args.field("body")
    )
}

/// The magic block leaves an intent marker for the synthesis pipeline
/// instead of emitting code directly.
fn emit_magic(args: &BlockArgs) -> String {
    emit_marker(args.field("prompt"), &args.indent)
}
