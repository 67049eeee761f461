//! Template evaluation for app definitions.
//!
//! Templates use Jinja syntax via minijinja. Undefined references are hard
//! errors so a typo in a definition never renders an empty field.

use crate::error::{Result, TerraceError};
use base64::{engine::general_purpose::STANDARD, Engine};
use minijinja::{Environment, UndefinedBehavior, Value};

pub struct TemplateEngine {
    env: Environment<'static>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_keep_trailing_newline(true);
        env.add_filter("b64enc", b64enc);
        Self { env }
    }

    /// Render `template`, reporting failures against `name`.
    pub fn render(&self, name: &str, template: &str, ctx: &Value) -> Result<String> {
        self.env
            .render_str(template, ctx)
            .map_err(|e| TerraceError::Template {
                name: name.to_string(),
                message: e.to_string(),
            })
    }
}

fn b64enc(value: &str) -> String {
    STANDARD.encode(value.as_bytes())
}
