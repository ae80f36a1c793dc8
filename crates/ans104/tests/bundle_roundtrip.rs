//! Compose a bundle payload out of signed items and take it apart again the
//! way the unbundler does.

use ans104::{
    decode_header, derive_bundle_id, encode_header, parse_bytes, sign_item, BundleEntry, ItemDraft,
    ItemSigner, Tag,
};

fn signer(seed: u8) -> ItemSigner {
    ItemSigner::Ed25519(ed25519_dalek::SigningKey::from_bytes(&[seed; 32]))
}

fn item(seed: u8, payload: &[u8]) -> Vec<u8> {
    let draft = ItemDraft {
        target: None,
        anchor: None,
        tags: vec![Tag::new("Content-Type", "application/octet-stream")],
    };
    sign_item(&signer(seed), &draft, payload).unwrap()
}

#[test]
fn bundle_composes_and_decomposes() {
    let items = vec![
        item(1, b"first payload"),
        item(2, b"second"),
        item(3, &vec![0xabu8; 4096]),
    ];

    let parsed: Vec<_> = items
        .iter()
        .map(|bytes| parse_bytes(bytes, None).unwrap())
        .collect();

    let entries: Vec<BundleEntry> = parsed
        .iter()
        .zip(&items)
        .map(|(item, bytes)| BundleEntry {
            size: bytes.len() as u64,
            id: item.id,
        })
        .collect();

    let header = encode_header(&entries);
    let payload: Vec<u8> = items.concat();

    // Decode the header and slice each child back out of the payload.
    let decoded = decode_header(&header).unwrap();
    assert_eq!(decoded, entries);

    let mut cursor = 0usize;
    for entry in &decoded {
        let child = &payload[cursor..cursor + entry.size as usize];
        let reparsed = parse_bytes(child, None).unwrap();
        assert_eq!(reparsed.id, entry.id);
        cursor += entry.size as usize;
    }
    assert_eq!(cursor, payload.len());
}

#[test]
fn bundle_id_is_stable_for_an_ordered_item_set() {
    let ids: Vec<_> = [1u8, 2, 3]
        .iter()
        .map(|&seed| parse_bytes(&item(seed, b"x"), None).unwrap().id)
        .collect();

    let first = derive_bundle_id(&ids);
    let second = derive_bundle_id(&ids);
    assert_eq!(first, second);

    let mut reversed = ids.clone();
    reversed.reverse();
    assert_ne!(first, derive_bundle_id(&reversed));
}
