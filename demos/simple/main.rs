use std::{sync::Arc, time::Duration};

use eventhub::{
    event_source, event_type,
    network::ReqwestHttpClient,
    rules::{RuleSet, RulesLoader},
    storage::Sandbox,
    Event, EventBuilder, EventData, EventHub, HubConfig, ListenerKey, SharedStateType,
};

const RULES: &str = r#"{
    "version": 1,
    "rules": [{
        "condition": {"type": "matcher", "definition": {"key": "action", "matcher": "eq", "values": ["purchase"]}},
        "consequences": [{
            "id": "postback",
            "type": "dispatch",
            "detail": {
                "type": "eventhub.eventType.rulesEngine",
                "source": "eventhub.eventSource.responseContent",
                "eventdataaction": "new",
                "eventdata": {"url": "https://example.com/{%~state.com.example.config/region%}?item={%item%}"}
            }
        }]
    }]
}"#;

pub fn main() {
    env_logger::init();

    let hub = EventHub::start(HubConfig::default()).unwrap();

    // Download rules if RULES_URL is set, otherwise use the bundled ones.
    let rules = match std::env::var("RULES_URL") {
        Ok(url) => {
            let sandbox = Sandbox::new(std::env::temp_dir().join("eventhub-demo")).unwrap();
            let store = Arc::new(sandbox.key_value_store("rules-cache.json").unwrap());
            let client = Arc::new(ReqwestHttpClient::new().unwrap());
            RulesLoader::new(client, store, sandbox).load(&url).unwrap()
        }
        Err(_) => RuleSet::from_json(RULES.as_bytes()).unwrap(),
    };
    hub.rules_engine().replace_rules(rules);

    hub.set_shared_state(
        SharedStateType::Standard,
        "com.example.config",
        EventData::new().with("region", "eu"),
        None,
    )
    .unwrap();

    hub.register_listener(
        ListenerKey::new(event_type::RULES_ENGINE, event_source::RESPONSE_CONTENT),
        |event: &Event| {
            println!("Consequence: {}", event.data().to_json());
        },
    );

    let purchase = EventBuilder::new("purchase", event_type::GENERIC_TRACK, event_source::REQUEST_CONTENT)
        .data(EventData::new().with("action", "purchase").with("item", "shoes"))
        .build();
    let sequence = hub.dispatch(purchase).unwrap();
    println!("Dispatched purchase as event #{sequence}");

    std::thread::sleep(Duration::from_millis(500));
    hub.shutdown().unwrap();
}
