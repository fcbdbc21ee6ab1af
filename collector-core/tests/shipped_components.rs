use std::collections::BTreeMap;
use std::path::PathBuf;

use collector_core::component::{ComponentStore, StepAction};
use collector_core::YamlComponentStore;

fn components_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../components")
}

fn params() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("account.username".to_string(), "ops@example.com".to_string()),
        ("account.password".to_string(), "secret".to_string()),
        ("params.data_domain".to_string(), "orders".to_string()),
        ("params.date_from".to_string(), "2024-03-01".to_string()),
        ("params.date_to".to_string(), "2024-03-31".to_string()),
        ("params.granularity".to_string(), "daily".to_string()),
    ])
}

#[tokio::test]
async fn demo_components_load_and_validate() {
    let store = YamlComponentStore::new(components_root());
    for name in ["login", "orders_export", "dismiss_banner"] {
        store
            .load("demo", name, &params(), None)
            .await
            .unwrap_or_else(|err| panic!("{name}: {err}"));
    }
}

#[tokio::test]
async fn export_url_is_rendered_from_task_params() {
    let store = YamlComponentStore::new(components_root());
    let component = store
        .load("demo", "orders_export", &params(), None)
        .await
        .unwrap();

    let StepAction::Navigate { url, .. } = &component.steps[0].action else {
        panic!("first step should navigate");
    };
    assert_eq!(
        url,
        "https://seller.example/orders?from=2024-03-01&to=2024-03-31"
    );
    assert!(component.parallel_safe);
}
