//! Resolution of rule keys and expansion of `{%key%}` tokens.
use std::sync::{Arc, LazyLock};

use chrono::SecondsFormat;
use rand::{thread_rng, Rng};
use regex::{Captures, Regex};

use crate::{Event, EventData, EventHistory, SharedStateStore, Variant};

static TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{%\s*([^%]+?)\s*%\}").expect("invalid regex"));

const STATE_PREFIX: &str = "~state.";

/// Read access to shared state as of an event.
pub trait StateLookup: Send + Sync {
    /// Resolved state of `module` as of sequence number `at`, if any.
    fn state_at(&self, module: &str, at: u64) -> Option<Arc<EventData>>;
}

impl StateLookup for SharedStateStore {
    fn state_at(&self, module: &str, at: u64) -> Option<Arc<EventData>> {
        self.get_state(module, at).data
    }
}

/// Everything a rule may look at: the triggering event, shared state as of that event, and the
/// event history.
#[derive(Clone, Copy)]
pub struct EvaluationContext<'a> {
    pub(crate) event: &'a Event,
    pub(crate) state: &'a dyn StateLookup,
    pub(crate) history: Option<&'a EventHistory>,
}

impl<'a> EvaluationContext<'a> {
    /// Context evaluating conditions and tokens against `event`.
    pub fn new(
        event: &'a Event,
        state: &'a dyn StateLookup,
        history: Option<&'a EventHistory>,
    ) -> EvaluationContext<'a> {
        EvaluationContext {
            event,
            state,
            history,
        }
    }

    /// Same context for a different event.
    pub(crate) fn with_event(self, event: &'a Event) -> EvaluationContext<'a> {
        EvaluationContext { event, ..self }
    }

    /// Resolve a rule key.
    ///
    /// Special keys start with `~`: `~type`, `~source`, `~timestampu` (seconds), `~timestampz`
    /// (ISO-8601), `~timestampp` (milliseconds), `~sdkver`, `~cachebust`, `~all_url`,
    /// `~all_json`, and `~state.<module>/<path>`. Any other key is a dotted path into the event
    /// data.
    pub fn resolve(&self, key: &str) -> Option<Variant> {
        let event = self.event;
        Some(match key {
            "~type" => Variant::string(event.event_type()),
            "~source" => Variant::string(event.source()),
            "~timestampu" => Variant::long(event.timestamp().timestamp()).ok()?,
            "~timestampz" => {
                Variant::string(event.timestamp().to_rfc3339_opts(SecondsFormat::Millis, true))
            }
            "~timestampp" => Variant::long(event.timestamp().timestamp_millis()).ok()?,
            "~sdkver" => Variant::string(env!("CARGO_PKG_VERSION")),
            "~cachebust" => Variant::integer(thread_rng().gen_range(0..100_000_000)),
            "~all_url" => Variant::string(url_encoded(event.data())),
            "~all_json" => Variant::string(event.data().to_json().to_string()),
            _ => {
                if let Some(state_key) = key.strip_prefix(STATE_PREFIX) {
                    return self.resolve_state(state_key);
                }
                event.data().get_path(key)?.clone()
            }
        })
    }

    /// `<module>/<path>`. Module names may contain dots, so the first `/` separates the two.
    fn resolve_state(&self, state_key: &str) -> Option<Variant> {
        let (module, path) = state_key.split_once('/')?;
        let state = self.state.state_at(module, self.event.sequence())?;
        state.get_path(path).cloned()
    }

    /// Replace every `{%key%}` token in `template`. Tokens that do not resolve expand to the
    /// empty string.
    pub fn expand(&self, template: &str) -> String {
        if !template.contains("{%") {
            return template.to_owned();
        }
        TOKEN
            .replace_all(template, |captures: &Captures| {
                self.resolve(&captures[1])
                    .filter(|value| !value.is_null())
                    .map(|value| value.convert_to_string())
                    .unwrap_or_default()
            })
            .into_owned()
    }

    /// Expand tokens in every string nested in `data`.
    pub fn expand_data(&self, data: &EventData) -> EventData {
        data.iter()
            .map(|(key, value)| (key.clone(), self.expand_variant(value)))
            .collect()
    }

    pub(crate) fn expand_variant(&self, value: &Variant) -> Variant {
        if let Ok(s) = value.as_str() {
            Variant::string(self.expand(s))
        } else if let Ok(map) = value.as_map() {
            Variant::map(map.iter().map(|(k, v)| (k.clone(), self.expand_variant(v))))
        } else if let Ok(list) = value.as_list() {
            Variant::list(list.iter().map(|v| self.expand_variant(v)))
        } else {
            value.clone()
        }
    }
}

/// Flattened data as a URL query string: `&key=value` pairs with form encoding.
fn url_encoded(data: &EventData) -> String {
    let flattened = data.flatten();
    if flattened.is_empty() {
        return String::new();
    }
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in &flattened {
        if !value.is_null() {
            serializer.append_pair(key, &value.convert_to_string());
        }
    }
    format!("&{}", serializer.finish())
}
