//! Read-only inventory of forms, fields, and clickable elements.
//!
//! The page side only collects raw attributes; selector suggestions are derived
//! here so that missing attributes simply drop their selector.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::driver::{DriverError, PageDriver};

/// Collects raw records in document order: forms, then fields, then clickables.
pub const SCAN_SCRIPT: &str = r#"(() => {
    const out = [];
    const attr = (el, name) => el.getAttribute(name);
    const visible = (el) => {
        const r = el.getBoundingClientRect();
        return el.offsetParent !== null || (r.width > 0 && r.height > 0);
    };
    const path = (el) => {
        const parts = [];
        for (let n = el; n && n !== document.body && n.parentElement; n = n.parentElement) {
            const same = Array.from(n.parentElement.children).filter((s) => s.tagName === n.tagName);
            parts.unshift(`${n.tagName.toLowerCase()}:nth-of-type(${same.indexOf(n) + 1})`);
        }
        return ['body', ...parts].join(' > ');
    };
    document.querySelectorAll('form').forEach((el) => out.push({
        kind: 'form', tag: 'form', path: path(el),
        id: el.id || null, name: attr(el, 'name'), className: attr(el, 'class'),
        action: attr(el, 'action'), visible: visible(el),
    }));
    document.querySelectorAll('input, textarea, select').forEach((el) => {
        const type = (attr(el, 'type') || '').toLowerCase();
        if (el.tagName === 'INPUT' && (type === 'submit' || type === 'button')) return;
        out.push({
            kind: 'field', tag: el.tagName.toLowerCase(),
            id: el.id || null, name: attr(el, 'name'), className: attr(el, 'class'),
            type: attr(el, 'type'), placeholder: attr(el, 'placeholder'),
            value: el.value ?? null, required: !!el.required, visible: visible(el),
        });
    });
    document.querySelectorAll('button, input[type="submit"], input[type="button"]').forEach((el) => out.push({
        kind: 'clickable', tag: el.tagName.toLowerCase(),
        id: el.id || null, name: attr(el, 'name'), className: attr(el, 'class'),
        type: attr(el, 'type'), value: el.value || null,
        text: (el.textContent || '').trim() || null, visible: visible(el),
    }));
    return out;
})()"#;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Form,
    Field,
    Clickable,
}

/// Page-side record as produced by [`SCAN_SCRIPT`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawElement {
    pub kind: Option<ItemKind>,
    pub tag: String,
    /// `body > ... > form:nth-of-type(n)`, forms only.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub class_name: Option<String>,
    #[serde(default, rename = "type")]
    pub input_type: Option<String>,
    #[serde(default)]
    pub placeholder: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub visible: bool,
}

/// Snapshot of one element at inspection time. Stale as soon as the page
/// changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomInventoryItem {
    pub kind: ItemKind,
    pub tag: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub input_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub class_list: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    pub required: bool,
    pub visible: bool,
    pub selectors: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetArea {
    All,
    Fields,
    Buttons,
}

impl TargetArea {
    /// Unknown or missing names mean everything.
    pub fn parse(area: Option<&str>) -> Self {
        match area.map(|a| a.trim().to_ascii_lowercase()).as_deref() {
            Some("fields") | Some("inputs") | Some("field") | Some("input") => TargetArea::Fields,
            Some("buttons") | Some("button") | Some("clickables") | Some("clickable") => {
                TargetArea::Buttons
            }
            Some("") | None | Some("all") | Some("form") | Some("forms") | Some("interactive") => {
                TargetArea::All
            }
            Some(other) => {
                debug!(area = other, "unknown target area, scanning everything");
                TargetArea::All
            }
        }
    }

    fn admits(self, kind: ItemKind) -> bool {
        match self {
            TargetArea::All => true,
            TargetArea::Fields => kind == ItemKind::Field,
            TargetArea::Buttons => kind == ItemKind::Clickable,
        }
    }
}

pub async fn inspect<D>(driver: &D, area: TargetArea) -> Result<Vec<DomInventoryItem>, DriverError>
where
    D: PageDriver + ?Sized,
{
    let value = driver.evaluate(SCAN_SCRIPT).await?;
    if value.is_null() {
        return Ok(Vec::new());
    }
    let raw: Vec<RawElement> = serde_json::from_value(value)
        .map_err(|e| DriverError::Script(format!("unexpected inventory payload: {e}")))?;
    let items: Vec<DomInventoryItem> = raw
        .into_iter()
        .filter_map(|r| {
            let kind = r.kind?;
            area.admits(kind).then(|| to_item(kind, r))
        })
        .collect();
    debug!(count = items.len(), ?area, "dom inventory collected");
    Ok(items)
}

fn to_item(kind: ItemKind, r: RawElement) -> DomInventoryItem {
    let class_list = split_classes(r.class_name.as_deref());
    let id = non_empty(r.id);
    let name = non_empty(r.name);
    let input_type = non_empty(r.input_type);
    let placeholder = non_empty(r.placeholder);
    let action = non_empty(r.action);

    let mut selectors = Vec::new();
    if let Some(id) = &id {
        selectors.push(id_selector(id));
    }
    if let Some(name) = &name {
        selectors.push(attr_selector("", "name", name));
    }
    match kind {
        ItemKind::Form => {
            if let Some(action) = &action {
                selectors.push(attr_selector("form", "action", action));
            }
            // Positional paths break on any layout change; last resort only.
            if selectors.is_empty() {
                selectors.extend(non_empty(r.path));
            }
        }
        ItemKind::Field => {
            if let Some(t) = &input_type {
                selectors.push(attr_selector(&r.tag, "type", t));
            }
            if let Some(p) = &placeholder {
                selectors.push(attr_selector("", "placeholder", p));
            }
            selectors.extend(class_selector(&class_list));
        }
        ItemKind::Clickable => {
            selectors.extend(class_selector(&class_list));
            if let Some(t) = &input_type {
                selectors.push(attr_selector(&r.tag, "type", t));
            }
        }
    }

    DomInventoryItem {
        kind,
        tag: r.tag,
        input_type,
        id,
        name,
        class_list,
        placeholder,
        value: r.value,
        text_content: non_empty(r.text),
        action,
        required: r.required,
        visible: r.visible,
        selectors,
    }
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|v| !v.trim().is_empty())
}

fn split_classes(class_name: Option<&str>) -> Vec<String> {
    class_name
        .map(|c| c.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

/// True for names usable after `#` or `.` without escaping.
fn is_css_ident(s: &str) -> bool {
    let body_ok = |c: char| c.is_ascii_alphanumeric() || c == '_' || c == '-' || !c.is_ascii();
    let rest = s.strip_prefix('-').unwrap_or(s);
    match rest.chars().next() {
        Some(c) if c.is_ascii_digit() || c == '-' => false,
        Some(_) => s.chars().all(body_ok),
        None => false,
    }
}

fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

pub fn id_selector(id: &str) -> String {
    if is_css_ident(id) {
        format!("#{id}")
    } else {
        attr_selector("", "id", id)
    }
}

pub fn attr_selector(tag: &str, attr: &str, value: &str) -> String {
    format!("{tag}[{attr}={}]", quote(value))
}

pub fn class_selector(classes: &[String]) -> Option<String> {
    let usable: Vec<&str> = classes
        .iter()
        .map(String::as_str)
        .filter(|c| is_css_ident(c))
        .collect();
    if usable.is_empty() {
        return None;
    }
    Some(format!(".{}", usable.join(".")))
}
