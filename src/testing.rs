//! In-memory [`PageDriver`] for tests and offline runs.
//!
//! Elements live in a small tree that is rendered to HTML and queried with
//! `scraper`, so selectors behave as CSS does in a browser. Trees should be
//! valid HTML; the parser moves misplaced elements (a `<form>` inside a
//! `<form>`, say) and the fake does not follow it there.

use async_trait::async_trait;
use scraper::{Html, Selector};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::agent::ChatModel;
use crate::driver::{DriverError, PageDriver};
use crate::inventory::{ItemKind, RawElement, SCAN_SCRIPT};
use crate::llm::{ChatMessage, FunctionCall, LlmError, ModelTurn, ToolCall};
use crate::tools::READY_STATE_SCRIPT;

const NODE_ATTR: &str = "data-fake-node";
const VOID_TAGS: [&str; 6] = ["input", "br", "hr", "img", "meta", "link"];

#[derive(Clone, Debug, Default)]
pub struct FakeElement {
    pub tag: String,
    pub id: Option<String>,
    pub name: Option<String>,
    pub classes: Vec<String>,
    pub input_type: Option<String>,
    pub placeholder: Option<String>,
    pub text: Option<String>,
    pub action: Option<String>,
    pub value: String,
    pub required: bool,
    pub visible: bool,
    /// Keystrokes beyond this length are dropped.
    pub max_length: Option<usize>,
    /// Keystrokes are ignored entirely.
    pub read_only: bool,
    pub clicks: usize,
    pub events: Vec<String>,
    pub children: Vec<FakeElement>,
}

impl FakeElement {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_ascii_lowercase(),
            visible: true,
            ..Default::default()
        }
    }

    pub fn id(mut self, id: &str) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn class(mut self, class: &str) -> Self {
        self.classes.extend(class.split_whitespace().map(str::to_string));
        self
    }

    pub fn input_type(mut self, t: &str) -> Self {
        self.input_type = Some(t.into());
        self
    }

    pub fn placeholder(mut self, p: &str) -> Self {
        self.placeholder = Some(p.into());
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn action(mut self, action: &str) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn value(mut self, value: &str) -> Self {
        self.value = value.into();
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Hides the element and everything under it.
    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    pub fn max_length(mut self, n: usize) -> Self {
        self.max_length = Some(n);
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn child(mut self, child: FakeElement) -> Self {
        self.children.push(child);
        self
    }

    fn attr(&self, name: &str) -> Option<String> {
        match name {
            "id" => self.id.clone(),
            "name" => self.name.clone(),
            "class" => (!self.classes.is_empty()).then(|| self.classes.join(" ")),
            "type" => self.input_type.clone(),
            "placeholder" => self.placeholder.clone(),
            "action" => self.action.clone(),
            "value" => Some(self.value.clone()),
            _ => None,
        }
    }

    fn kind(&self) -> Option<ItemKind> {
        let ty = self.input_type.as_deref().unwrap_or("").to_ascii_lowercase();
        match self.tag.as_str() {
            "form" => Some(ItemKind::Form),
            "button" => Some(ItemKind::Clickable),
            "input" if ty == "submit" || ty == "button" => Some(ItemKind::Clickable),
            "input" | "textarea" | "select" => Some(ItemKind::Field),
            _ => None,
        }
    }
}

/// Flattened tree in document order; `parents[i]` is `None` for children of
/// `<body>`.
#[derive(Default)]
struct Document {
    nodes: Vec<FakeElement>,
    parents: Vec<Option<usize>>,
    url: Option<String>,
    navigations: Vec<String>,
    navigation_error: Option<DriverError>,
    screenshots: usize,
    scripts: HashMap<String, Value>,
}

impl Document {
    fn insert(&mut self, mut element: FakeElement, parent: Option<usize>) {
        let children = std::mem::take(&mut element.children);
        let at = self.nodes.len();
        self.nodes.push(element);
        self.parents.push(parent);
        for child in children {
            self.insert(child, Some(at));
        }
    }

    fn children_of(&self, parent: Option<usize>) -> impl Iterator<Item = usize> + '_ {
        (0..self.nodes.len()).filter(move |&i| self.parents[i] == parent)
    }

    fn is_visible(&self, mut i: usize) -> bool {
        loop {
            if !self.nodes[i].visible {
                return false;
            }
            match self.parents[i] {
                Some(p) => i = p,
                None => return true,
            }
        }
    }

    fn render(&self) -> String {
        let mut html = String::from("<!DOCTYPE html><html><head></head><body>");
        for root in self.children_of(None) {
            self.render_node(root, &mut html);
        }
        html.push_str("</body></html>");
        html
    }

    fn render_node(&self, i: usize, out: &mut String) {
        let e = &self.nodes[i];
        let _ = write!(out, "<{} {}=\"{}\"", e.tag, NODE_ATTR, i);
        for name in ["id", "name", "class", "type", "placeholder", "action"] {
            if let Some(v) = e.attr(name) {
                let _ = write!(out, " {}=\"{}\"", name, escape(&v));
            }
        }
        if e.tag == "input" && !e.value.is_empty() {
            let _ = write!(out, " value=\"{}\"", escape(&e.value));
        }
        if e.required {
            out.push_str(" required");
        }
        if !e.visible {
            out.push_str(" hidden");
        }
        out.push('>');
        if VOID_TAGS.contains(&e.tag.as_str()) {
            return;
        }
        if let Some(text) = &e.text {
            out.push_str(&escape(text));
        }
        for child in self.children_of(Some(i)) {
            self.render_node(child, out);
        }
        let _ = write!(out, "</{}>", e.tag);
    }

    fn first_match(&self, selector: &str) -> Result<Option<usize>, DriverError> {
        let parsed = Selector::parse(selector)
            .map_err(|e| DriverError::Script(format!("'{selector}' is not a valid selector: {e:?}")))?;
        let html = Html::parse_document(&self.render());
        let found = html
            .select(&parsed)
            .find_map(|el| el.value().attr(NODE_ATTR)?.parse::<usize>().ok());
        Ok(found)
    }

    /// `body > div:nth-of-type(2) > form:nth-of-type(1)` for node `i`.
    fn positional_path(&self, i: usize) -> String {
        let mut parts = Vec::new();
        let mut current = Some(i);
        while let Some(n) = current {
            let parent = self.parents[n];
            let tag = &self.nodes[n].tag;
            let nth = self
                .children_of(parent)
                .filter(|&s| self.nodes[s].tag == *tag)
                .position(|s| s == n)
                .map_or(1, |p| p + 1);
            parts.push(format!("{tag}:nth-of-type({nth})"));
            current = parent;
        }
        parts.push("body".into());
        parts.reverse();
        parts.join(" > ")
    }

    fn raw(&self, i: usize) -> Option<RawElement> {
        let e = &self.nodes[i];
        let kind = e.kind()?;
        Some(RawElement {
            kind: Some(kind),
            tag: e.tag.clone(),
            path: (kind == ItemKind::Form).then(|| self.positional_path(i)),
            id: e.id.clone(),
            name: e.name.clone(),
            class_name: e.attr("class"),
            input_type: e.input_type.clone(),
            placeholder: e.placeholder.clone(),
            value: (kind != ItemKind::Form).then(|| e.value.clone()),
            text: e.text.clone(),
            action: e.action.clone(),
            required: e.required,
            visible: self.is_visible(i),
        })
    }

    /// What [`SCAN_SCRIPT`] returns on a live page: forms, then fields, then
    /// clickables, each group in document order.
    fn scan(&self) -> Vec<RawElement> {
        let raw: Vec<RawElement> = (0..self.nodes.len()).filter_map(|i| self.raw(i)).collect();
        let mut out = Vec::with_capacity(raw.len());
        for kind in [ItemKind::Form, ItemKind::Field, ItemKind::Clickable] {
            out.extend(raw.iter().filter(|r| r.kind == Some(kind)).cloned());
        }
        out
    }
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

pub struct FakePage {
    doc: Mutex<Document>,
    closed: AtomicBool,
}

impl FakePage {
    pub fn new(elements: Vec<FakeElement>) -> Self {
        let mut doc = Document::default();
        for e in elements {
            doc.insert(e, None);
        }
        Self {
            doc: Mutex::new(doc),
            closed: AtomicBool::new(false),
        }
    }

    fn doc(&self) -> MutexGuard<'_, Document> {
        self.doc.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Appends `element` at the end of `<body>`, as a script-rendered form would.
    pub fn push(&self, element: FakeElement) {
        self.doc().insert(element, None);
    }

    /// The next navigation fails with `err`.
    pub fn fail_navigation(&self, err: DriverError) {
        self.doc().navigation_error = Some(err);
    }

    /// Answer `script` with a canned result instead of the built-in emulation.
    pub fn stub_script(&self, script: &str, result: Value) {
        self.doc().scripts.insert(script.to_string(), result);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn navigations(&self) -> Vec<String> {
        self.doc().navigations.clone()
    }

    pub fn screenshots(&self) -> usize {
        self.doc().screenshots
    }

    fn inspect<T>(&self, selector: &str, f: impl FnOnce(&FakeElement) -> T) -> Option<T> {
        let doc = self.doc();
        match doc.first_match(selector) {
            Ok(Some(i)) => Some(f(&doc.nodes[i])),
            _ => None,
        }
    }

    pub fn value_of(&self, selector: &str) -> Option<String> {
        self.inspect(selector, |e| e.value.clone())
    }

    pub fn clicks_of(&self, selector: &str) -> usize {
        self.inspect(selector, |e| e.clicks).unwrap_or(0)
    }

    pub fn events_of(&self, selector: &str) -> Vec<String> {
        self.inspect(selector, |e| e.events.clone()).unwrap_or_default()
    }

    fn ensure_open(&self) -> Result<(), DriverError> {
        if self.is_closed() {
            return Err(DriverError::SessionClosed);
        }
        Ok(())
    }

    fn with_element<T>(
        &self,
        selector: &str,
        f: impl FnOnce(&mut FakeElement) -> T,
    ) -> Result<T, DriverError> {
        self.ensure_open()?;
        let mut doc = self.doc();
        let i = doc
            .first_match(selector)?
            .ok_or_else(|| DriverError::NotFound(selector.to_string()))?;
        Ok(f(&mut doc.nodes[i]))
    }
}

#[async_trait]
impl PageDriver for FakePage {
    async fn navigate(&self, url: &str, _timeout: Duration) -> Result<(), DriverError> {
        self.ensure_open()?;
        let mut doc = self.doc();
        if let Some(err) = doc.navigation_error.take() {
            return Err(err);
        }
        doc.url = Some(url.to_string());
        doc.navigations.push(url.to_string());
        Ok(())
    }

    async fn current_url(&self) -> Result<Option<String>, DriverError> {
        self.ensure_open()?;
        Ok(self.doc().url.clone())
    }

    async fn wait_for_visible(&self, selector: &str, timeout: Duration) -> Result<(), DriverError> {
        self.ensure_open()?;
        let doc = self.doc();
        match doc.first_match(selector)? {
            Some(i) if doc.is_visible(i) => Ok(()),
            _ => Err(DriverError::Timeout(timeout)),
        }
    }

    async fn read_property(&self, selector: &str, prop: &str) -> Result<Option<Value>, DriverError> {
        self.with_element(selector, |e| e.attr(prop).map(Value::String))
    }

    async fn set_value(&self, selector: &str, value: &str) -> Result<(), DriverError> {
        self.with_element(selector, |e| e.value = value.to_string())
    }

    async fn dispatch_events(&self, selector: &str, events: &[&str]) -> Result<(), DriverError> {
        self.with_element(selector, |e| {
            e.events.extend(events.iter().map(|s| s.to_string()))
        })
    }

    async fn focus(&self, selector: &str) -> Result<(), DriverError> {
        self.with_element(selector, |_| ())
    }

    async fn scroll_into_view(&self, selector: &str) -> Result<(), DriverError> {
        self.with_element(selector, |_| ())
    }

    async fn click(&self, selector: &str) -> Result<(), DriverError> {
        self.with_element(selector, |e| e.clicks += 1)
    }

    async fn type_text(&self, selector: &str, text: &str) -> Result<(), DriverError> {
        self.with_element(selector, |e| {
            if e.read_only {
                return;
            }
            for c in text.chars() {
                if e.max_length.is_some_and(|n| e.value.chars().count() >= n) {
                    break;
                }
                e.value.push(c);
            }
            e.events.push("input".into());
        })
    }

    async fn capture_screenshot(&self) -> Result<Vec<u8>, DriverError> {
        self.ensure_open()?;
        let mut doc = self.doc();
        doc.screenshots += 1;
        let mut png = b"\x89PNG\r\n\x1a\n".to_vec();
        png.extend_from_slice(&(doc.screenshots as u32).to_be_bytes());
        Ok(png)
    }

    async fn evaluate(&self, script: &str) -> Result<Value, DriverError> {
        self.ensure_open()?;
        let doc = self.doc();
        if let Some(v) = doc.scripts.get(script) {
            return Ok(v.clone());
        }
        if script == SCAN_SCRIPT {
            return serde_json::to_value(doc.scan()).map_err(|e| DriverError::Script(e.to_string()));
        }
        if script.trim() == READY_STATE_SCRIPT {
            return Ok(json!("complete"));
        }
        Err(DriverError::Script("script not supported by fake page".into()))
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// A [`ChatModel`] that replays canned turns and records every conversation
/// it was shown. Tool call ids are assigned as `call_<turn>_<index>`.
#[derive(Clone, Default)]
pub struct ScriptedModel {
    turns: Arc<Mutex<VecDeque<ModelTurn>>>,
    seen: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
}

impl ScriptedModel {
    pub fn new(turns: Vec<ModelTurn>) -> Self {
        Self {
            turns: Arc::new(Mutex::new(turns.into())),
            seen: Arc::default(),
        }
    }

    pub fn message(text: &str) -> ModelTurn {
        ModelTurn::Message { text: text.into() }
    }

    /// `(tool name, raw JSON arguments)` pairs for one turn.
    pub fn calls(calls: &[(&str, &str)]) -> ModelTurn {
        ModelTurn::ToolCalls {
            text: None,
            calls: calls
                .iter()
                .map(|(name, args)| ToolCall {
                    id: String::new(),
                    kind: "function".into(),
                    function: FunctionCall {
                        name: (*name).into(),
                        arguments: (*args).into(),
                    },
                })
                .collect(),
        }
    }

    pub fn seen(&self) -> Vec<Vec<ChatMessage>> {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn complete(&self, messages: &[ChatMessage], _tools: &Value) -> Result<ModelTurn, LlmError> {
        let turn = {
            let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
            seen.push(messages.to_vec());
            seen.len() - 1
        };
        let next = self
            .turns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .ok_or_else(|| LlmError::Decode("script exhausted".into()))?;
        Ok(match next {
            ModelTurn::ToolCalls { text, mut calls } => {
                for (j, call) in calls.iter_mut().enumerate() {
                    call.id = format!("call_{turn}_{j}");
                }
                ModelTurn::ToolCalls { text, calls }
            }
            message => message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page() -> FakePage {
        FakePage::new(vec![
            FakeElement::new("form")
                .id("signup")
                .child(FakeElement::new("input").id("email").name("email").input_type("email"))
                .child(FakeElement::new("input").placeholder("Your password").input_type("password"))
                .child(FakeElement::new("input").name("token").input_type("hidden").hidden())
                .child(FakeElement::new("button").class("btn btn-submit").text("Go")),
            FakeElement::new("div").child(FakeElement::new("form").action("/two")),
        ])
    }

    fn find(page: &FakePage, selector: &str) -> Option<usize> {
        page.doc().first_match(selector).unwrap()
    }

    #[test]
    fn css_selectors_resolve_against_the_tree() {
        let page = page();
        assert_eq!(find(&page, "#email"), Some(1));
        assert_eq!(find(&page, "form #email"), Some(1));
        assert_eq!(find(&page, "#signup > input[type=\"email\"]"), Some(1));
        assert_eq!(find(&page, "input[type=EMAIL i]"), Some(1));
        assert_eq!(find(&page, "[placeholder*='password']"), Some(2));
        assert_eq!(find(&page, "input:not([type=email])"), Some(2));
        assert_eq!(find(&page, "#nope, [name=email]"), Some(1));
        assert_eq!(find(&page, "button.btn.btn-submit"), Some(4));
        assert_eq!(find(&page, "div > form:nth-of-type(1)"), Some(6));
        assert_eq!(find(&page, "#missing"), None);
    }

    #[test]
    fn invalid_selectors_are_script_errors() {
        let page = page();
        for bad in ["", "button[[", "input::", "#"] {
            assert!(
                matches!(page.doc().first_match(bad), Err(DriverError::Script(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn hidden_ancestors_hide_descendants() {
        let page = FakePage::new(vec![
            FakeElement::new("div").hidden().child(FakeElement::new("input").id("inside")),
        ]);
        let doc = page.doc();
        let i = doc.first_match("#inside").unwrap().unwrap();
        assert!(!doc.is_visible(i));
    }

    #[test]
    fn positional_paths_count_siblings_per_parent() {
        let page = FakePage::new(vec![
            FakeElement::new("div").child(FakeElement::new("form").child(FakeElement::new("input").id("a"))),
            FakeElement::new("div").child(FakeElement::new("form").child(FakeElement::new("input").id("b"))),
        ]);
        let doc = page.doc();
        let forms: Vec<_> = doc.scan().into_iter().filter_map(|r| r.path).collect();
        assert_eq!(
            forms,
            vec![
                "body > div:nth-of-type(1) > form:nth-of-type(1)",
                "body > div:nth-of-type(2) > form:nth-of-type(1)",
            ]
        );
        assert_eq!(doc.first_match(&forms[1]).unwrap(), doc.first_match("#b").unwrap().map(|i| i - 1));
    }

    #[tokio::test]
    async fn values_render_into_attribute_selectors() {
        let page = page();
        page.set_value("#email", "a@b.com").await.unwrap();
        assert_eq!(page.value_of("input[value=\"a@b.com\"]").as_deref(), Some("a@b.com"));
    }

    #[tokio::test]
    async fn pushed_elements_become_queryable() {
        let page = FakePage::new(vec![]);
        assert!(page.wait_for_visible("#late", Duration::ZERO).await.is_err());
        page.push(FakeElement::new("input").id("late"));
        page.wait_for_visible("#late", Duration::ZERO).await.unwrap();
    }

    #[tokio::test]
    async fn stubbed_scripts_take_precedence() {
        let page = FakePage::new(vec![]);
        page.stub_script(READY_STATE_SCRIPT, json!("loading"));
        assert_eq!(page.evaluate(READY_STATE_SCRIPT).await.unwrap(), json!("loading"));
    }
}
