//! Page observation: visible-text extraction plus a numbered-element harvest.
//!
//! Each harvest re-tags the live DOM with `data-pilot-id` attributes and
//! returns a fresh id -> descriptor map. Tags from the previous harvest are
//! stripped first, so ids are only meaningful for the observation that
//! produced them.

use chromiumoxide::Page;
use serde::Deserialize;

use super::{ElementDescriptor, ElementMap, PageObservation};

/// Hard budget on extracted page text handed to the LLM.
const TEXT_BUDGET: usize = 12_000;

/// Upper bound on harvested interactive elements per observation.
const ELEMENT_LIMIT: usize = 60;

/// Elements worth offering to the LLM for interaction.
const INTERACTIVE_SELECTOR: &str =
    "a, button, input, select, textarea, [onclick], [role='button'], [contenteditable='true']";

const HARVEST_JS: &str = r#"
(() => {
    document.querySelectorAll('[data-pilot-id]').forEach(el => el.removeAttribute('data-pilot-id'));
    const nodes = document.querySelectorAll("__SELECTOR__");
    const elements = [];
    let id = 0;
    for (const el of nodes) {
        if (elements.length >= __LIMIT__) break;
        const rect = el.getBoundingClientRect();
        if (rect.width === 0 || rect.height === 0) continue;
        id += 1;
        el.setAttribute('data-pilot-id', String(id));
        const label = (el.innerText || el.value || el.placeholder ||
            el.getAttribute('aria-label') || '').trim().slice(0, 80);
        elements.push({
            id: id,
            name: label || el.tagName.toLowerCase(),
        });
    }
    const text = (document.body ? document.body.innerText : '').slice(0, __BUDGET__);
    return { title: document.title || '', text: text, elements: elements };
})()
"#;

#[derive(Debug, Deserialize)]
struct Harvest {
    title: String,
    text: String,
    elements: Vec<HarvestedElement>,
}

#[derive(Debug, Deserialize)]
struct HarvestedElement {
    id: u32,
    name: String,
}

fn harvest_script() -> String {
    HARVEST_JS
        .replace("__SELECTOR__", INTERACTIVE_SELECTOR)
        .replace("__LIMIT__", &ELEMENT_LIMIT.to_string())
        .replace("__BUDGET__", &TEXT_BUDGET.to_string())
}

/// Selector a harvested id resolves to for the lifetime of one observation.
pub fn selector_for(id: u32) -> String {
    format!("[data-pilot-id=\"{}\"]", id)
}

/// Run the harvest against the live page.
pub async fn harvest(page: &Page) -> anyhow::Result<PageObservation> {
    let result = page.evaluate(harvest_script()).await?;
    let harvest: Harvest = result
        .into_value()
        .map_err(|e| anyhow::anyhow!("Malformed page harvest: {}", e))?;

    let mut elements = ElementMap::new();
    for el in harvest.elements {
        elements.insert(
            el.id,
            ElementDescriptor {
                name: el.name,
                selector: selector_for(el.id),
            },
        );
    }

    let url = page.url().await?.map(|u| u.to_string()).unwrap_or_default();

    Ok(PageObservation {
        url,
        title: harvest.title,
        text: harvest.text,
        elements,
    })
}
