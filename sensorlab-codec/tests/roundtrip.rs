// Every event kind survives encode → decode once its declarations are known
use chrono::Utc;
use sensorlab_codec::{
    DecodeError, Decoder, Event, IdScope, Property, PropertyValue, Unit, UnitPrefix,
};

const NODE: u32 = 42;

fn roundtrip(decoder: &mut Decoder, event: Event) {
    let bytes = event.encode_record(NODE).expect("event encodes");
    let record = decoder
        .decode(Utc::now(), &bytes)
        .unwrap_or_else(|e| panic!("{:?} failed to decode: {}", event.kind(), e));
    assert_eq!(record.node_id, NODE);
    assert_eq!(record.event, event);
}

fn sample_properties() -> Vec<Property> {
    vec![
        Property::new(0, "enabled", PropertyValue::Bool(true)),
        Property::new(1, "i8", PropertyValue::I8(-128)),
        Property::new(2, "i16", PropertyValue::I16(-300)),
        Property::new(3, "i32", PropertyValue::I32(i32::MIN)),
        Property::new(4, "i64", PropertyValue::I64(i64::MAX)),
        Property::new(5, "u8", PropertyValue::U8(255)),
        Property::new(6, "u16", PropertyValue::U16(65535)),
        Property::new(7, "u32", PropertyValue::U32(7)),
        Property::new(8, "u64", PropertyValue::U64(u64::MAX)),
        Property::new(9, "temperature", PropertyValue::F32(21.5)).with_unit(UnitPrefix::None, Unit::Celsius),
        Property::new(10, "frequency", PropertyValue::F64(2.405)).with_unit(UnitPrefix::Giga, Unit::Hertz),
        Property::new(11, "label", PropertyValue::from("sink")),
        Property::new(12, "address", PropertyValue::Bytes(vec![0xde, 0xad, 0xbe, 0xef])),
        Property::new(13, "garbage", PropertyValue::Invalid(vec![1, 2, 3])),
        Property::new(14, "samples", PropertyValue::F32Array(vec![0.5, -1.25])),
        Property::new(15, "times", PropertyValue::F64Array(vec![])),
    ]
}

fn updated(properties: &[Property]) -> Vec<Property> {
    properties
        .iter()
        .map(|p| {
            let mut p = p.clone();
            p.value = match p.value {
                PropertyValue::Bool(v) => PropertyValue::Bool(!v),
                PropertyValue::U8(v) => PropertyValue::U8(v.wrapping_add(1)),
                PropertyValue::Ascii(_) => PropertyValue::from(""),
                PropertyValue::F64Array(_) => PropertyValue::F64Array(vec![1.0, 2.0, 3.0]),
                other => other,
            };
            p
        })
        .collect()
}

#[test]
fn node_events_roundtrip() {
    let mut decoder = Decoder::new();
    let properties = sample_properties();

    roundtrip(&mut decoder, Event::NodeAdd { properties: properties.clone() });
    roundtrip(&mut decoder, Event::NodePropertyAdd { properties: vec![] });
    roundtrip(&mut decoder, Event::NodePropertyUpdate { properties: updated(&properties) });
    roundtrip(&mut decoder, Event::NodeRemove);
}

#[test]
fn entity_and_link_events_roundtrip() {
    let mut decoder = Decoder::new();
    let properties = sample_properties();
    let link_properties = vec![Property::new(0, "lqi", PropertyValue::U8(200))];

    roundtrip(
        &mut decoder,
        Event::EntityAdd { entity_id: 1, name: "mac".into(), properties: properties.clone() },
    );
    roundtrip(
        &mut decoder,
        Event::EntityPropertyAdd {
            entity_id: 1,
            properties: vec![Property::new(20, "queue", PropertyValue::U16(3))],
        },
    );
    roundtrip(
        &mut decoder,
        Event::EntityPropertyUpdate { entity_id: 1, properties: updated(&properties) },
    );
    roundtrip(
        &mut decoder,
        Event::LinkAdd {
            entity_id: 1,
            link_id: 4,
            source_properties: vec![properties[11].clone()],
            target_properties: vec![properties[12].clone(), properties[5].clone()],
            properties: link_properties.clone(),
        },
    );
    roundtrip(
        &mut decoder,
        Event::LinkPropertyAdd {
            entity_id: 1,
            link_id: 4,
            properties: vec![Property::new(1, "rssi", PropertyValue::I8(-90)).with_unit(UnitPrefix::None, Unit::DecibelMilliwatt)],
        },
    );
    roundtrip(
        &mut decoder,
        Event::LinkPropertyUpdate { entity_id: 1, link_id: 4, properties: updated(&link_properties) },
    );
    roundtrip(&mut decoder, Event::LinkRemove { entity_id: 1, link_id: 4 });
    roundtrip(&mut decoder, Event::EntityRemove { entity_id: 1 });
}

#[test]
fn frame_events_roundtrip() {
    let mut decoder = Decoder::new();
    let frame_properties = vec![Property::new(0, "length", PropertyValue::U16(4))];

    roundtrip(&mut decoder, Event::EntityAdd { entity_id: 1, name: "app".into(), properties: vec![] });
    roundtrip(&mut decoder, Event::EntityAdd { entity_id: 2, name: "phy".into(), properties: vec![] });
    roundtrip(
        &mut decoder,
        Event::FrameProduce {
            entity_id: 1,
            frame_id: 8,
            data: vec![1, 2, 3, 4],
            properties: frame_properties.clone(),
        },
    );
    roundtrip(
        &mut decoder,
        Event::FramePropertyUpdate { entity_id: 1, frame_id: 8, properties: updated(&frame_properties) },
    );
    roundtrip(
        &mut decoder,
        Event::FramePropertyAdd {
            entity_id: 2,
            frame_id: 8,
            properties: vec![Property::new(1, "crc", PropertyValue::Bool(true))],
        },
    );
    roundtrip(&mut decoder, Event::FrameDataUpdate { entity_id: 1, frame_id: 8, data: vec![] });
    roundtrip(&mut decoder, Event::FrameTx { entity_id: 2, frame_id: 8, data: vec![9; 127] });
    roundtrip(
        &mut decoder,
        Event::FrameRx { entity_id: 2, frame_id: 8, data: vec![9; 127], properties: vec![] },
    );
    roundtrip(&mut decoder, Event::FrameConsume { entity_id: 2, frame_id: 8, data: vec![9] });

    // Consumed at entity 2: no scope left there
    let update = Event::FramePropertyUpdate {
        entity_id: 2,
        frame_id: 8,
        properties: vec![Property::new(1, "crc", PropertyValue::Bool(false))],
    };
    let bytes = update.encode_record(NODE).unwrap();
    assert_eq!(
        decoder.decode(Utc::now(), &bytes).unwrap_err(),
        DecodeError::UnknownId { scope: IdScope::Frame { entity_id: 2 }, id: 8 }
    );
}

#[test]
fn boundary_lengths_roundtrip() {
    let mut decoder = Decoder::new();
    let properties = vec![
        Property::new(0, "", PropertyValue::from("")),
        Property::new(1, "n".repeat(255), PropertyValue::Bytes(vec![0xAB; 255])),
        Property::new(2, "a", PropertyValue::from("x".repeat(255))),
        Property::new(3, "empty", PropertyValue::F32Array(vec![])),
        Property::new(4, "raw", PropertyValue::Invalid(vec![])),
    ];

    roundtrip(&mut decoder, Event::EntityAdd { entity_id: 0, name: String::new(), properties: properties.clone() });
    roundtrip(
        &mut decoder,
        Event::EntityAdd { entity_id: 255, name: "e".repeat(255), properties: vec![] },
    );
    roundtrip(
        &mut decoder,
        Event::FrameProduce { entity_id: 255, frame_id: 255, data: vec![0; 65535], properties: vec![] },
    );
}

#[test]
fn entity_id_reuse_drops_stale_declarations() {
    let mut decoder = Decoder::new();
    let old = Property::new(3, "power", PropertyValue::F32(1.0)).with_unit(UnitPrefix::Milli, Unit::Watt);

    roundtrip(&mut decoder, Event::EntityAdd { entity_id: 5, name: "radio".into(), properties: vec![old.clone()] });
    roundtrip(
        &mut decoder,
        Event::LinkAdd {
            entity_id: 5,
            link_id: 1,
            source_properties: vec![],
            target_properties: vec![],
            properties: vec![],
        },
    );
    roundtrip(&mut decoder, Event::EntityRemove { entity_id: 5 });
    roundtrip(&mut decoder, Event::EntityAdd { entity_id: 5, name: "sensor".into(), properties: vec![] });

    let stale_property = Event::EntityPropertyUpdate { entity_id: 5, properties: vec![old] };
    assert_eq!(
        decoder.decode(Utc::now(), &stale_property.encode_record(NODE).unwrap()).unwrap_err(),
        DecodeError::UnknownId { scope: IdScope::Property, id: 3 }
    );

    let stale_link = Event::LinkRemove { entity_id: 5, link_id: 1 };
    assert_eq!(
        decoder.decode(Utc::now(), &stale_link.encode_record(NODE).unwrap()).unwrap_err(),
        DecodeError::UnknownId { scope: IdScope::Link { entity_id: 5 }, id: 1 }
    );
}

#[test]
fn frames_need_a_live_entity() {
    let unknown_entity = |id| DecodeError::UnknownId { scope: IdScope::Entity, id };

    let mut decoder = Decoder::new();
    let orphan = Event::FrameProduce { entity_id: 9, frame_id: 1, data: vec![1, 2], properties: vec![] };
    assert_eq!(
        decoder.decode(Utc::now(), &orphan.encode_record(NODE).unwrap()).unwrap_err(),
        unknown_entity(9)
    );

    let mut decoder = Decoder::new();
    let length = Property::new(0, "length", PropertyValue::U8(2));
    roundtrip(&mut decoder, Event::EntityAdd { entity_id: 1, name: "app".into(), properties: vec![] });
    roundtrip(
        &mut decoder,
        Event::FrameProduce { entity_id: 1, frame_id: 4, data: vec![1, 2], properties: vec![length.clone()] },
    );
    let elsewhere = Event::FramePropertyAdd { entity_id: 5, frame_id: 4, properties: vec![length] };
    assert_eq!(
        decoder.decode(Utc::now(), &elsewhere.encode_record(NODE).unwrap()).unwrap_err(),
        unknown_entity(5)
    );

    roundtrip(&mut decoder, Event::EntityRemove { entity_id: 1 });
    let after_removal = Event::FrameTx { entity_id: 1, frame_id: 4, data: vec![3] };
    assert_eq!(
        decoder.decode(Utc::now(), &after_removal.encode_record(NODE).unwrap()).unwrap_err(),
        unknown_entity(1)
    );
}

#[test]
fn reset_keeps_node_declarations() {
    let mut decoder = Decoder::new();
    let state = Property::new(1, "state", PropertyValue::from("ready"));

    roundtrip(&mut decoder, Event::NodePropertyAdd { properties: vec![state.clone()] });
    roundtrip(&mut decoder, Event::EntityAdd { entity_id: 1, name: "mac".into(), properties: vec![] });
    decoder.reset();

    let mut running = state;
    running.value = PropertyValue::from("running");
    roundtrip(&mut decoder, Event::NodePropertyUpdate { properties: vec![running] });

    let bytes = Event::EntityRemove { entity_id: 1 }.encode_record(NODE).unwrap();
    assert!(decoder.decode(Utc::now(), &bytes).is_err());
}
