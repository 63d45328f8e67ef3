//! Configuration code generation for remediation plans

use crate::config::OutputFormat;
use crate::error::Result;
use crate::models::{ChangeAction, RemediationPlan, RemediationType, Sensitivity};
use crate::state::{set_path, to_json, StateMap, StateValue};
use serde_json::{json, Map, Value};
use std::fmt::Write as _;

/// Produces apply-ready configuration for a plan
///
/// The returned text is opaque to the rest of the engine.
pub trait CodeGenerator: Send + Sync {
    /// Render the configuration for a plan
    fn generate_code(&self, plan: &RemediationPlan) -> Result<String>;

    /// Commands bringing an unmanaged resource under management
    fn generate_import_commands(&self, plan: &RemediationPlan) -> Vec<String>;
}

/// Attributes written into the resource block of an import
pub fn import_attributes(resource_type: &str) -> &'static [&'static str] {
    match resource_type {
        "aws_instance" => &["ami", "instance_type"],
        "aws_s3_bucket" => &["bucket"],
        "aws_security_group" => &["name"],
        "azurerm_virtual_machine" => &["name", "location", "resource_group_name"],
        "google_compute_instance" => &["name", "machine_type", "zone"],
        "digitalocean_droplet" => &["name", "size", "image", "region"],
        _ => &["name"],
    }
}

/// File terraform loads generated configuration from
///
/// Terraform JSON documents need the `.tf.json` suffix; anything else is
/// parsed as native HCL.
pub fn config_file_name(code: &str) -> &'static str {
    if code.trim_start().starts_with('{') {
        "main.tf.json"
    } else {
        "main.tf"
    }
}

/// Terraform provider name of a cloud provider
///
/// Falls back to the resource type prefix when the provider is unknown.
pub fn provider_name(provider: &str, resource_type: &str) -> String {
    match provider.to_lowercase().as_str() {
        "aws" => "aws".to_string(),
        "azure" | "azurerm" => "azurerm".to_string(),
        "gcp" | "google" => "google".to_string(),
        "" => resource_type
            .split('_')
            .next()
            .unwrap_or_default()
            .to_string(),
        other => other.to_string(),
    }
}

/// Default generator producing HCL or Terraform JSON
#[derive(Debug, Clone, Default)]
pub struct HclCodeGenerator {
    format: OutputFormat,
}

impl HclCodeGenerator {
    /// Create a generator for `format`
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    fn ignore_changes(plan: &RemediationPlan) -> Vec<String> {
        let mut fields: Vec<String> = plan
            .changes
            .iter()
            .filter(|c| c.sensitivity == Sensitivity::Low)
            .map(|c| c.path.clone())
            .collect();
        for common in ["tags", "tags_all"] {
            if !fields.iter().any(|f| f == common) {
                fields.push(common.to_string());
            }
        }
        fields
    }

    fn changed_attributes(plan: &RemediationPlan) -> StateMap {
        let mut changed = StateMap::new();
        for change in &plan.changes {
            if matches!(change.action, ChangeAction::Add | ChangeAction::Update) {
                let Some(value) = &change.new_value else {
                    continue;
                };
                let root = change.path.split('.').next().unwrap_or(&change.path);
                let indexed = change.path.split('.').any(|s| s.parse::<usize>().is_ok());
                match plan.desired_state.get(root) {
                    // list items are only addressable as part of the whole list
                    Some(whole) if indexed => {
                        changed.insert(root.to_string(), whole.clone());
                    }
                    _ => set_path(&mut changed, &change.path, value.clone()),
                }
            }
        }
        changed
    }

    fn import_state(plan: &RemediationPlan) -> StateMap {
        import_attributes(&plan.resource_type)
            .iter()
            .filter_map(|attr| {
                plan.current_state
                    .get(*attr)
                    .map(|v| (attr.to_string(), v.clone()))
            })
            .collect()
    }

    fn generate_hcl(&self, plan: &RemediationPlan) -> String {
        let mut w = HclWriter::default();
        let address = plan.address();

        w.open("locals");
        w.attr("_remediation_plan_id", &StateValue::from(plan.id.as_str()));
        w.attr("_remediation_type", &StateValue::from(plan.remediation_type.as_str()));
        w.attr(
            "_generated_at",
            &StateValue::from(plan.created_at.format("%Y-%m-%d %H:%M:%S").to_string()),
        );
        w.close();

        let provider = provider_name(&plan.provider, &plan.resource_type);
        w.open(&format!("provider \"{provider}\""));
        match provider.as_str() {
            "aws" => w.raw("region", "var.aws_region"),
            "azurerm" => {
                w.open("features");
                w.close();
            }
            "google" => {
                w.raw("project", "var.gcp_project");
                w.raw("region", "var.gcp_region");
            }
            _ => {}
        }
        w.close();

        let resource_header = format!(
            "resource \"{}\" \"{}\"",
            plan.resource_type, plan.resource_name
        );
        match plan.remediation_type {
            RemediationType::Create | RemediationType::Replace => {
                w.open(&resource_header);
                w.attrs(&plan.desired_state);
                if plan.remediation_type == RemediationType::Replace {
                    w.open("lifecycle");
                    w.attr("create_before_destroy", &StateValue::Bool(true));
                    w.close();
                }
                w.close();
            }
            RemediationType::Update => {
                w.open(&resource_header);
                w.attrs(&Self::changed_attributes(plan));
                w.open("lifecycle");
                w.raw(
                    "ignore_changes",
                    &format!("[{}]", Self::ignore_changes(plan).join(", ")),
                );
                w.close();
                w.close();
            }
            RemediationType::Delete => {
                w.open("removed");
                w.raw("from", &address);
                w.open("lifecycle");
                w.attr("destroy", &StateValue::Bool(true));
                w.close();
                w.close();
            }
            RemediationType::Import => {
                w.open(&resource_header);
                w.attrs(&Self::import_state(plan));
                w.close();
                w.open("import");
                w.raw("to", &address);
                w.attr("id", &StateValue::from(plan.resource_id.as_str()));
                w.close();
            }
        }

        if plan.remediation_type != RemediationType::Delete {
            w.open(&format!("output \"{}_id\"", plan.resource_name));
            w.raw("value", &format!("{address}.id"));
            w.attr(
                "description",
                &StateValue::from(format!("ID of {} resource", plan.resource_name)),
            );
            w.close();
        }

        w.finish()
    }

    fn generate_json(&self, plan: &RemediationPlan) -> Result<String> {
        let provider = provider_name(&plan.provider, &plan.resource_type);
        let mut root = Map::new();
        root.insert(
            "locals".to_string(),
            json!({
                "_remediation_plan_id": plan.id,
                "_remediation_type": plan.remediation_type.as_str(),
            }),
        );
        root.insert("provider".to_string(), json!({ provider: {} }));

        let body = match plan.remediation_type {
            RemediationType::Create | RemediationType::Replace => Some(to_json(&plan.desired_state)),
            RemediationType::Update => {
                let mut body = to_json(&Self::changed_attributes(plan));
                if let Value::Object(map) = &mut body {
                    map.insert(
                        "lifecycle".to_string(),
                        json!({ "ignore_changes": Self::ignore_changes(plan) }),
                    );
                }
                Some(body)
            }
            RemediationType::Import => Some(to_json(&Self::import_state(plan))),
            RemediationType::Delete => None,
        };

        match body {
            Some(body) => {
                root.insert(
                    "resource".to_string(),
                    json!({ plan.resource_type.clone(): { plan.resource_name.clone(): body } }),
                );
            }
            None => {
                root.insert(
                    "removed".to_string(),
                    json!({ "from": plan.address(), "lifecycle": { "destroy": true } }),
                );
            }
        }
        if plan.remediation_type == RemediationType::Import {
            root.insert(
                "import".to_string(),
                json!({ "to": plan.address(), "id": plan.resource_id }),
            );
        }

        Ok(serde_json::to_string_pretty(&Value::Object(root))?)
    }
}

impl CodeGenerator for HclCodeGenerator {
    fn generate_code(&self, plan: &RemediationPlan) -> Result<String> {
        match self.format {
            OutputFormat::Hcl => Ok(self.generate_hcl(plan)),
            OutputFormat::Json => self.generate_json(plan),
        }
    }

    fn generate_import_commands(&self, plan: &RemediationPlan) -> Vec<String> {
        vec![format!(
            "terraform import {} {}",
            plan.address(),
            plan.resource_id
        )]
    }
}

/// Minimal indented HCL emitter
#[derive(Default)]
struct HclWriter {
    buf: String,
    depth: usize,
}

impl HclWriter {
    fn line(&mut self, text: &str) {
        for _ in 0..self.depth {
            self.buf.push_str("  ");
        }
        self.buf.push_str(text);
        self.buf.push('\n');
    }

    fn open(&mut self, header: &str) {
        self.line(&format!("{header} {{"));
        self.depth += 1;
    }

    fn close(&mut self) {
        self.depth = self.depth.saturating_sub(1);
        self.line("}");
        if self.depth == 0 {
            self.buf.push('\n');
        }
    }

    fn raw(&mut self, key: &str, expr: &str) {
        self.line(&format!("{key} = {expr}"));
    }

    fn attr(&mut self, key: &str, value: &StateValue) {
        let rendered = render_value(value, self.depth);
        self.raw(&render_key(key), &rendered);
    }

    fn attrs(&mut self, state: &StateMap) {
        for (key, value) in state {
            self.attr(key, value);
        }
    }

    fn finish(mut self) -> String {
        while self.buf.ends_with("\n\n") {
            self.buf.pop();
        }
        self.buf
    }
}

pub(crate) fn render_key(key: &str) -> String {
    let bare = key
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if bare {
        key.to_string()
    } else {
        quote(key)
    }
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn render_number(n: &serde_json::Number) -> String {
    match n.as_f64() {
        Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
        _ => n.to_string(),
    }
}

pub(crate) fn render_value(value: &StateValue, depth: usize) -> String {
    match value {
        StateValue::Null => "null".to_string(),
        StateValue::Bool(b) => b.to_string(),
        StateValue::Number(n) => render_number(n),
        StateValue::String(s) => quote(s),
        StateValue::List(items) => {
            let items: Vec<String> = items.iter().map(|v| render_value(v, depth)).collect();
            format!("[{}]", items.join(", "))
        }
        StateValue::Object(map) if map.is_empty() => "{}".to_string(),
        StateValue::Object(map) => {
            let pad = "  ".repeat(depth + 1);
            let mut out = String::from("{\n");
            for (key, value) in map {
                let _ = writeln!(
                    out,
                    "{pad}{} = {}",
                    render_key(key),
                    render_value(value, depth + 1)
                );
            }
            out.push_str(&"  ".repeat(depth));
            out.push('}');
            out
        }
    }
}
