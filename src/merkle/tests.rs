use super::*;

struct Identity<'a> {
    name: &'a str,
    mode: u32,
    uid: u32,
    gid: u32,
}

const IDENT: Identity<'static> = Identity {
    name: "data",
    mode: 0o100644,
    uid: 1000,
    gid: 1000,
};

fn generate_tree(data: &[u8], ident: &Identity<'_>, same_file: bool) -> (Vec<u8>, Vec<u8>) {
    let mut tree = Vec::new();
    // In the same-file layout the tree region follows the data region
    // in one file.
    if same_file {
        tree.extend_from_slice(data);
    }
    let root = generate(&mut GenerateParams {
        data: &data,
        size: data.len() as u64,
        name: ident.name,
        mode: ident.mode,
        uid: ident.uid,
        gid: ident.gid,
        tree: &mut tree,
        data_and_tree_in_same_file: same_file,
    })
    .unwrap();
    (root, tree)
}

fn verify_range(
    data: &[u8],
    tree: &[u8],
    ident: &Identity<'_>,
    root: &[u8],
    offset: u64,
    len: u64,
    same_file: bool,
) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    verify(&mut VerifyParams {
        out: &mut out,
        data: &data,
        tree: &tree,
        size: data.len() as u64,
        name: ident.name,
        mode: ident.mode,
        uid: ident.uid,
        gid: ident.gid,
        read_offset: offset,
        read_size: len,
        expected: root,
        data_and_tree_in_same_file: same_file,
    })?;
    Ok(out)
}

#[test]
fn layout_single_block() {
    let layout = Layout::new(10, false);
    assert_eq!(layout.num_levels(), 1);
    assert_eq!(layout.level_offset(0), 0);
    assert_eq!(layout.tree_size(), BLOCK_SIZE);
}

#[test]
fn layout_two_levels() {
    // 129 data blocks need two level-0 blocks, so a root level appears
    // above them.
    let layout = Layout::new(129 * BLOCK_SIZE, false);
    assert_eq!(layout.num_levels(), 2);
    // Top-down order: the root block precedes level 0 in the file.
    assert_eq!(layout.level_offset(1), 0);
    assert_eq!(layout.level_offset(0), BLOCK_SIZE);
    assert_eq!(layout.tree_size(), 3 * BLOCK_SIZE);
}

#[test]
fn layout_same_file_starts_after_data() {
    let layout = Layout::new(100, true);
    assert_eq!(layout.level_offset(0), BLOCK_SIZE);
}

#[test]
fn round_trip_small() {
    let data = b"hello\n";
    let (root, tree) = generate_tree(data, &IDENT, false);
    let out = verify_range(data, &tree, &IDENT, &root, 0, data.len() as u64, false).unwrap();
    assert_eq!(out, data);
}

#[test]
fn round_trip_empty() {
    let (root, tree) = generate_tree(&[], &IDENT, false);
    assert_eq!(tree.len(), BLOCK_SIZE as usize);
    let out = verify_range(&[], &tree, &IDENT, &root, 0, 0, false).unwrap();
    assert!(out.is_empty());
}

#[test]
fn round_trip_multi_level() {
    // Enough blocks to force a second tree level.
    let data: Vec<u8> = (0..130 * BLOCK_SIZE).map(|i| (i % 251) as u8).collect();
    let (root, tree) = generate_tree(&data, &IDENT, false);
    assert_eq!(tree.len(), 4 * BLOCK_SIZE as usize);
    let out = verify_range(&data, &tree, &IDENT, &root, 0, data.len() as u64, false).unwrap();
    assert_eq!(out, data);
}

#[test]
fn partial_reads_are_exact() {
    let data: Vec<u8> = (0..3 * BLOCK_SIZE + 77).map(|i| (i % 253) as u8).collect();
    let (root, tree) = generate_tree(&data, &IDENT, false);
    for (offset, len) in [
        (0u64, 1u64),
        (1, 17),
        (BLOCK_SIZE - 1, 2),
        (BLOCK_SIZE, BLOCK_SIZE),
        (2 * BLOCK_SIZE + 5, 200),
        (3 * BLOCK_SIZE, 77),
    ] {
        let out = verify_range(&data, &tree, &IDENT, &root, offset, len, false).unwrap();
        assert_eq!(
            out,
            &data[offset as usize..(offset + len) as usize],
            "range [{offset}, +{len})"
        );
    }
}

#[test]
fn reads_clamp_at_end() {
    let data = vec![0xabu8; 100];
    let (root, tree) = generate_tree(&data, &IDENT, false);
    let out = verify_range(&data, &tree, &IDENT, &root, 90, 1000, false).unwrap();
    assert_eq!(out, &data[90..]);
    // At or past the end only the root is checked.
    let out = verify_range(&data, &tree, &IDENT, &root, 100, 10, false).unwrap();
    assert!(out.is_empty());
}

#[test]
fn zero_length_read_authenticates_root() {
    let data = b"metadata check".to_vec();
    let (root, tree) = generate_tree(&data, &IDENT, false);
    assert!(verify_range(&data, &tree, &IDENT, &root, 0, 0, false).is_ok());

    let tampered = Identity { uid: 0, ..IDENT };
    let err = verify_range(&data, &tree, &tampered, &root, 0, 0, false).unwrap_err();
    assert!(matches!(err, Error::VerificationFailed(_)));
}

#[test]
fn tampered_data_fails() {
    let data: Vec<u8> = (0..2 * BLOCK_SIZE).map(|i| (i % 256) as u8).collect();
    let (root, tree) = generate_tree(&data, &IDENT, false);

    let mut bad = data.clone();
    bad[BLOCK_SIZE as usize + 3] ^= 1;
    let err =
        verify_range(&bad, &tree, &IDENT, &root, 0, bad.len() as u64, false).unwrap_err();
    assert!(matches!(err, Error::VerificationFailed(_)));

    // Blocks verify independently; the clean block still reads.
    let out = verify_range(&bad, &tree, &IDENT, &root, 0, BLOCK_SIZE, false).unwrap();
    assert_eq!(out, &data[..BLOCK_SIZE as usize]);
}

#[test]
fn tampered_tree_fails() {
    let data = vec![7u8; 5000];
    let (root, mut tree) = generate_tree(&data, &IDENT, false);
    tree[0] ^= 0x80;
    let err = verify_range(&data, &tree, &IDENT, &root, 0, 10, false).unwrap_err();
    assert!(matches!(err, Error::VerificationFailed(_)));
}

#[test]
fn tampered_identity_fails() {
    let data = b"same bytes".to_vec();
    let (root, tree) = generate_tree(&data, &IDENT, false);
    for bad in [
        Identity { name: "other", ..IDENT },
        Identity { mode: 0o100600, ..IDENT },
        Identity { uid: 0, ..IDENT },
        Identity { gid: 0, ..IDENT },
    ] {
        let err =
            verify_range(&data, &tree, &bad, &root, 0, data.len() as u64, false).unwrap_err();
        assert!(matches!(err, Error::VerificationFailed(_)));
    }
}

#[test]
fn identical_bytes_distinct_identity_distinct_roots() {
    let data = b"identical".to_vec();
    let (a, _) = generate_tree(&data, &IDENT, false);
    let (b, _) = generate_tree(&data, &Identity { name: "peer", ..IDENT }, false);
    assert_ne!(a, b);
}

#[test]
fn same_file_layout_round_trip() {
    // Model a directory tree file: 96 bytes of child hashes followed by
    // the tree region.
    let data: Vec<u8> = (0..96u32).map(|i| i as u8).collect();
    let (root, file) = generate_tree(&data, &IDENT, true);
    assert_eq!(file.len(), 2 * BLOCK_SIZE as usize);
    assert_eq!(&file[..96], &data[..]);

    // Both the data region and the tree come from the same stream.
    let mut out = Vec::new();
    let n = verify(&mut VerifyParams {
        out: &mut out,
        data: &file,
        tree: &file,
        size: data.len() as u64,
        name: IDENT.name,
        mode: IDENT.mode,
        uid: IDENT.uid,
        gid: IDENT.gid,
        read_offset: 32,
        read_size: 32,
        expected: &root,
        data_and_tree_in_same_file: true,
    })
    .unwrap();
    assert_eq!(n, 32);
    assert_eq!(out, &data[32..64]);
}

#[test]
fn truncated_tree_is_malformed() {
    let data = vec![1u8; 10];
    let (root, tree) = generate_tree(&data, &IDENT, false);
    let short = &tree[..tree.len() - 1];
    let err = verify_range(&data, short, &IDENT, &root, 0, 10, false).unwrap_err();
    assert!(matches!(err, Error::MalformedTree(_)));
}

#[test]
fn truncated_data_is_malformed() {
    let data = vec![1u8; 3000];
    let (root, tree) = generate_tree(&data, &IDENT, false);
    let short = &data[..2999];
    let mut out = Vec::new();
    let err = verify(&mut VerifyParams {
        out: &mut out,
        data: &short,
        tree: &tree,
        size: data.len() as u64,
        name: IDENT.name,
        mode: IDENT.mode,
        uid: IDENT.uid,
        gid: IDENT.gid,
        read_offset: 0,
        read_size: 3000,
        expected: &root,
        data_and_tree_in_same_file: false,
    })
    .unwrap_err();
    assert!(matches!(err, Error::MalformedTree(_)));
}

#[test]
fn wrong_expected_length_fails() {
    let data = b"x".to_vec();
    let (_, tree) = generate_tree(&data, &IDENT, false);
    let err = verify_range(&data, &tree, &IDENT, &[0u8; 16], 0, 1, false).unwrap_err();
    assert!(matches!(err, Error::VerificationFailed(_)));
}
