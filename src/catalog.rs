use std::collections::HashSet;

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

use crate::dispatch::Dispatcher;
use crate::dispatch::router;
use crate::dispatch::session::{BALANCED_MODEL, CREATIVE_MODEL, PRECISE_MODEL};
use crate::error::LlmError;
use crate::text::relative_date;

#[derive(Clone, Debug, PartialEq)]
pub struct ModelCatalogEntry {
    pub id: String,
    pub created_at: Option<DateTime<Utc>>,
    pub author: String,
    pub description: String,
}

/// `(id, author, description)` for every model the router knows by name.
const BUILTIN: &[(&str, &str, &str)] = &[
    ("text-davinci-003", "openai", "Most capable GPT-3 completion model"),
    ("text-davinci-002", "openai", "GPT-3 completion model trained with supervised fine-tuning"),
    ("text-curie-001", "openai", "Fast GPT-3 completion model"),
    ("text-babbage-001", "openai", "Straightforward tasks, very fast"),
    ("text-ada-001", "openai", "Simple tasks, fastest GPT-3 model"),
    ("davinci", "openai", "Base GPT-3 model"),
    ("curie", "openai", "Base GPT-3 model, faster than davinci"),
    ("babbage", "openai", "Base GPT-3 model"),
    ("ada", "openai", "Smallest base GPT-3 model"),
    ("gpt-3.5-turbo", "openai", "Chat model optimized for dialogue"),
    ("gpt-3.5-turbo-0301", "openai", "Snapshot of gpt-3.5-turbo from March 1st 2023"),
    ("gpt-4", "openai", "Large multimodal chat model"),
    ("gpt-4-0314", "openai", "Snapshot of gpt-4 from March 14th 2023"),
    ("gpt-4-32k", "openai", "gpt-4 with a 32k token context"),
    ("gpt-4-32k-0314", "openai", "Snapshot of gpt-4-32k from March 14th 2023"),
    (CREATIVE_MODEL, "microsoft", "Bing chat, creative conversation style"),
    (BALANCED_MODEL, "microsoft", "Bing chat, balanced conversation style"),
    (PRECISE_MODEL, "microsoft", "Bing chat, precise conversation style"),
];

#[derive(Deserialize)]
struct ModelList {
    data: Vec<LiveModel>,
}

#[derive(Deserialize)]
struct LiveModel {
    id: String,
    created: Option<i64>,
    #[serde(default)]
    owned_by: String,
}

pub fn builtin() -> Vec<ModelCatalogEntry> {
    BUILTIN
        .iter()
        .map(|(id, author, description)| ModelCatalogEntry {
            id: id.to_string(),
            created_at: None,
            author: author.to_string(),
            description: description.to_string(),
        })
        .collect()
}

/// Static entries first in table order, enriched by live data; live-only ids
/// follow alphabetically.
pub fn merge(
    mut static_entries: Vec<ModelCatalogEntry>,
    live: Vec<ModelCatalogEntry>,
) -> Vec<ModelCatalogEntry> {
    let known: HashSet<String> = static_entries.iter().map(|e| e.id.clone()).collect();

    for entry in static_entries.iter_mut() {
        if let Some(found) = live.iter().find(|l| l.id == entry.id) {
            entry.created_at = found.created_at.or(entry.created_at);
            if entry.author.is_empty() {
                entry.author = found.author.clone();
            }
        }
    }

    let mut extra: Vec<ModelCatalogEntry> =
        live.into_iter().filter(|l| !known.contains(&l.id)).collect();
    extra.sort_by(|a, b| a.id.cmp(&b.id));
    static_entries.extend(extra);
    static_entries
}

pub async fn fetch_live(ctx: &Dispatcher) -> Result<Vec<ModelCatalogEntry>, LlmError> {
    let client = ctx.openai()?;
    let (list, _raw): (ModelList, _) = client.get("/models").await?;
    Ok(list
        .data
        .into_iter()
        .map(|m| ModelCatalogEntry {
            created_at: m.created.and_then(|s| Utc.timestamp_opt(s, 0).single()),
            id: m.id,
            author: m.owned_by,
            description: String::new(),
        })
        .collect())
}

/// Built-in table merged with whatever the provider reports. Live failures
/// degrade to the built-in table.
pub async fn load(ctx: &Dispatcher) -> Vec<ModelCatalogEntry> {
    let live = match fetch_live(ctx).await {
        Ok(live) => live,
        Err(e) if e.is_configuration() => {
            tracing::debug!("skipping live model list: {e}");
            vec![]
        }
        Err(e) => {
            tracing::warn!("failed to fetch live model list: {}", e.user_message());
            vec![]
        }
    };
    merge(builtin(), live)
}

pub fn render(entries: &[ModelCatalogEntry], now: DateTime<Utc>) -> String {
    let id_width = entries.iter().map(|e| e.id.len()).max().unwrap_or(0);
    let author_width = entries.iter().map(|e| e.author.len()).max().unwrap_or(0);

    let mut out = String::new();
    for entry in entries {
        let age = entry
            .created_at
            .map(|t| relative_date(t, now))
            .unwrap_or_else(|| "-".to_string());
        let backend = router::route(&entry.id).name();
        let line = format!(
            "{:id_width$}  {:author_width$}  {:17}  {:17}  {}",
            entry.id, entry.author, backend, age, entry.description
        );
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}
