//! End-to-end scenarios exercising `PathFs` against a real package file on
//! disk, one test per numbered scenario in the design.

use std::io::Cursor;

use appfs::inode::Inode;
use appfs::pathfs::{Context, PathFs};
use appfs::PackageMeta;
use tempfile::NamedTempFile;

const CTX: Context = Context { uid: 1000, gid: 1000 };

/// Counts the blocks in a file's segment-info chain, starting at
/// `next_segment_info` (0 means no chain at all).
fn segment_chain_len(fs: &PathFs, path: &str) -> usize {
    let id = fs.engine().resolve_pathname_to_inode_id(path).unwrap();
    let inode = fs.engine().get_inode_by_id_real(id).unwrap();
    let mut pos = match inode {
        Inode::File(f) | Inode::Symlink(f) | Inode::Device(f) => f.next_segment_info as u64,
        _ => panic!("not a file-like inode"),
    };
    let mut count = 0;
    while pos != 0 {
        let mut buf = vec![0u8; appfs::layout::BLOCK_SIZE as usize];
        fs.engine().stream().seekg(pos);
        fs.engine().stream().read(&mut buf);
        match Inode::decode(&mut Cursor::new(&buf)).unwrap() {
            Inode::SegmentInfo(block) => {
                count += 1;
                pos = block.next as u64;
            }
            _ => panic!("expected segment-info block at {pos}"),
        }
    }
    count
}

fn new_package() -> (NamedTempFile, PathFs) {
    let file = NamedTempFile::new().expect("create temp file");
    // `create_package` creates its own file at this path; drop the handle's
    // own fd but keep the path alive for the lifetime of the test.
    let path = file.path().to_path_buf();
    std::fs::remove_file(&path).ok();
    let fs = PathFs::create_package(&path, PackageMeta::default()).expect("create package");
    (file, fs)
}

#[test]
fn scenario_1_round_trip_one_file() {
    let (_tmp, fs) = new_package();
    fs.create_file(CTX, "/hello", 0o644).unwrap();

    let stream = fs.open("/hello").unwrap();
    stream.seekp(0);
    let written = stream.write(b"Hello, world!").unwrap();
    assert_eq!(written, 13);
    stream.close();

    let stream = fs.open("/hello").unwrap();
    let mut buf = [0u8; 13];
    let n = stream.read(&mut buf).unwrap();
    assert_eq!(n, 13);
    assert_eq!(&buf, b"Hello, world!");

    let attr = fs.get_attributes("/hello").unwrap();
    assert_eq!(attr.size, 13);
    assert_eq!(attr.block_count, 1);
}

#[test]
fn scenario_2_directory_listing_squeezes_holes() {
    let (_tmp, fs) = new_package();
    fs.make_directory(CTX, "/d", 0o755).unwrap();
    fs.create_file(CTX, "/d/a", 0o644).unwrap();
    fs.create_file(CTX, "/d/b", 0o644).unwrap();
    fs.create_file(CTX, "/d/c", 0o644).unwrap();
    fs.unlink("/d/b").unwrap();
    fs.create_file(CTX, "/d/d", 0o644).unwrap();

    let entries = fs.read_directory("/d").unwrap();
    let names: Vec<String> = entries
        .into_iter()
        .map(|(name, _)| String::from_utf8(name).unwrap())
        .collect();
    assert_eq!(names, vec!["a", "c", "d"]);
}

#[test]
fn scenario_3_grow_then_shrink_across_segment_blocks() {
    let (_tmp, fs) = new_package();
    fs.create_file(CTX, "/big", 0o644).unwrap();
    fs.truncate("/big", 4096 * 1024).unwrap();

    let attr = fs.get_attributes("/big").unwrap();
    assert_eq!(attr.size, 4096 * 1024);
    assert_eq!(segment_chain_len(&fs, "/big"), 1);

    fs.truncate("/big", 4096).unwrap();
    let attr = fs.get_attributes("/big").unwrap();
    assert_eq!(attr.size, 4096);
    assert_eq!(attr.block_count, 1);
    assert_eq!(segment_chain_len(&fs, "/big"), 0);
}

#[test]
fn scenario_4_hardlink_unlink_semantics() {
    let (_tmp, fs) = new_package();
    fs.create_file(CTX, "/f", 0o644).unwrap();
    fs.link("/f", "/g").unwrap();

    assert_eq!(fs.get_attributes("/f").unwrap().nlink, 2);
    assert_eq!(fs.get_attributes("/g").unwrap().nlink, 2);

    fs.unlink("/g").unwrap();
    assert_eq!(fs.get_attributes("/f").unwrap().nlink, 1);
    assert!(fs.get_attributes("/g").is_err());

    fs.unlink("/f").unwrap();
    assert!(fs.get_attributes("/f").is_err());
}

#[test]
fn scenario_5_rename_across_parents() {
    let (_tmp, fs) = new_package();
    fs.make_directory(CTX, "/a", 0o755).unwrap();
    fs.make_directory(CTX, "/b", 0o755).unwrap();
    fs.create_file(CTX, "/a/x", 0o644).unwrap();

    fs.rename(CTX, "/a/x", "/b/y").unwrap();

    assert!(fs.read_directory("/a").unwrap().is_empty());
    let names: Vec<String> = fs
        .read_directory("/b")
        .unwrap()
        .into_iter()
        .map(|(name, _)| String::from_utf8(name).unwrap())
        .collect();
    assert_eq!(names, vec!["y"]);
}

#[test]
fn scenario_6_filename_too_long_rejected() {
    let (_tmp, fs) = new_package();
    let long_name = format!("/{}", "a".repeat(300));
    let err = fs.create_file(CTX, &long_name, 0o644).unwrap_err();
    assert!(matches!(err, appfs::Error::FilenameTooLong));

    let huge_path = format!("/{}", "a/".repeat(2048));
    let err = fs.create_file(CTX, &huge_path, 0o644).unwrap_err();
    assert!(matches!(err, appfs::Error::PathNotValid));
}

#[test]
fn symlink_round_trip() {
    let (_tmp, fs) = new_package();
    fs.create_file(CTX, "/target.txt", 0o644).unwrap();
    fs.symbolic_link(CTX, "/link.txt", b"/target.txt").unwrap();

    let target = fs.read_link("/link.txt").unwrap();
    assert_eq!(target, b"/target.txt");
}

#[test]
fn write_at_offset_extends_file_with_zero_fill() {
    let (_tmp, fs) = new_package();
    fs.create_file(CTX, "/sparse", 0o644).unwrap();
    let stream = fs.open("/sparse").unwrap();
    stream.seekp(4096 * 2);
    stream.write(b"tail").unwrap();

    let attr = fs.get_attributes("/sparse").unwrap();
    assert_eq!(attr.size, 4096 * 2 + 4);

    let mut buf = vec![0u8; 4096];
    stream.seekg(0);
    let n = stream.read(&mut buf).unwrap();
    assert_eq!(n, 4096);
    assert!(buf.iter().all(|&b| b == 0));
}

#[test]
fn rmdir_requires_empty_directory() {
    let (_tmp, fs) = new_package();
    fs.make_directory(CTX, "/d", 0o755).unwrap();
    fs.create_file(CTX, "/d/a", 0o644).unwrap();

    let err = fs.remove_directory("/d").unwrap_err();
    assert!(matches!(err, appfs::Error::DirectoryNotEmpty));

    fs.unlink("/d/a").unwrap();
    fs.remove_directory("/d").unwrap();
    assert!(fs.get_attributes("/d").is_err());
}
