//! Round-trip coverage for the reserved length-prefixed binary framing.

use serde_json::{Map, Value, json};

use jmsgate::framing::{pack, unpack};

fn header_of(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

#[test]
fn round_trip_over_opcode_and_payload_grid() {
    let headers = [
        Map::new(),
        header_of(&[("filename", json!("x"))]),
        header_of(&[
            ("filename", json!("目录/文件.bin")),
            ("size", json!(987_654_321u64)),
            ("origin_path", json!("/local/源")),
            ("nested", json!({"a": [1, 2, 3], "b": null})),
        ]),
    ];
    let payloads: Vec<Vec<u8>> = vec![
        Vec::new(),
        vec![0u8],
        b"plain ascii".to_vec(),
        (0..=255u8).collect(),
        vec![0xffu8; 100_000],
    ];

    for opcode in [0u8, 1, 7, 8, 127, 255] {
        for header in &headers {
            for payload in &payloads {
                let packed = pack(opcode, Some(header), Some(payload));
                let got = unpack(&packed).expect("unpack");
                assert_eq!(got.opcode, opcode);
                assert_eq!(&got.header, header);
                assert_eq!(&got.data, payload);
            }
        }
    }
}

#[test]
fn header_length_prefix_is_big_endian() {
    let header = header_of(&[("k", json!("v"))]);
    let packed = pack(3, Some(&header), None);
    let header_len = serde_json::to_vec(&header).unwrap().len() as u16;
    assert_eq!(packed[0], 3);
    assert_eq!([packed[1], packed[2]], header_len.to_be_bytes());
}

#[test]
fn data_survives_bytes_that_look_like_json() {
    let header = header_of(&[("filename", json!("a"))]);
    let payload = br#"{"code": 0, "message": "fake"}"#.to_vec();
    let got = unpack(&pack(9, Some(&header), Some(&payload))).expect("unpack");
    assert_eq!(got.data, payload);
}
