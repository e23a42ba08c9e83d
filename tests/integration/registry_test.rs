//! Registry populated through `register_message!`.

use bitlet::registry::MessageTypeRegistry;
use bitlet::MessageKind;
use uuid::Uuid;

use crate::common::*;

#[test]
fn test_inventory_collects_registered_types() {
    let registry = MessageTypeRegistry::from_inventory().unwrap();

    assert!(registry.contains("ExampleModelCreated"));
    assert!(registry.contains("ExampleModelArchived"));
    assert!(!registry.contains("UnknownKind"));
}

#[test]
fn test_inventory_descriptor_decodes() {
    let registry = MessageTypeRegistry::from_inventory().unwrap();
    let event = ExampleModelCreated::new(Uuid::new_v4());
    let payload = serde_json::to_vec(&event).unwrap();

    let descriptor = registry.lookup("ExampleModelCreated").unwrap();
    assert_eq!(descriptor.kind(), MessageKind::Event);

    let decoded = descriptor.decode(&payload).unwrap();
    assert_eq!(decoded.downcast_ref::<ExampleModelCreated>(), Some(&event));
}

#[test]
fn test_payload_uses_field_names() {
    let model_id = Uuid::new_v4();
    let event = ExampleModelCreated::new(model_id);
    let json: serde_json::Value = serde_json::to_value(&event).unwrap();

    assert_eq!(json["model_id"], serde_json::json!(model_id.to_string()));
    assert_eq!(json["id"], serde_json::json!(event.id.to_string()));
}
