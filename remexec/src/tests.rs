// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::time::Duration;

use maplit::btreemap;

use hashing::Digest;

use crate::{
    decode, encode, encode_with_digest, Action, Code, Command, Directory, DirectoryNode,
    FileNode, Operation, Platform, Resource, Stage, Status, StreamKind, WriteSession,
};

fn test_command() -> Command {
    Command {
        arguments: vec!["/bin/echo".to_owned(), "hello".to_owned()],
        environment_variables: btreemap! { "PATH".to_owned() => "/bin".to_owned() },
        output_files: vec!["out.txt".to_owned()],
        output_directories: vec![],
        working_directory: String::new(),
        platform: Platform::default(),
    }
}

fn test_action(command_digest: Digest) -> Action {
    Action {
        command_digest,
        input_root_digest: Digest::of_bytes(b"input-root"),
        timeout: Some(Duration::from_secs(60)),
        do_not_cache: false,
        platform: Platform::default(),
    }
}

#[test]
fn encoding_is_deterministic() {
    let command = test_command();
    let (digest1, bytes1) = encode_with_digest(&command).unwrap();
    let (digest2, bytes2) = encode_with_digest(&command).unwrap();
    assert_eq!(digest1, digest2);
    assert_eq!(bytes1, bytes2);
    assert_eq!(digest1, Digest::of_bytes(&bytes1));
}

#[test]
fn action_round_trip() {
    let action = test_action(Digest::of_bytes(b"command"));
    let bytes = encode(&action).unwrap();
    assert_eq!(decode::<Action>(&bytes).unwrap(), action);
}

#[test]
fn decode_failure_is_internal() {
    let err = decode::<Action>(b"not an action").unwrap_err();
    assert_eq!(err.code, Code::Internal);
}

#[test]
fn canonical_directories_have_equal_digests() {
    let file_a = FileNode {
        name: "a".to_owned(),
        digest: Digest::of_bytes(b"a"),
        is_executable: false,
    };
    let file_b = FileNode {
        name: "b".to_owned(),
        digest: Digest::of_bytes(b"b"),
        is_executable: true,
    };
    let subdir = DirectoryNode {
        name: "sub".to_owned(),
        digest: Digest::of_bytes(b"sub"),
    };

    let mut forward = Directory {
        files: vec![file_a.clone(), file_b.clone()],
        directories: vec![subdir.clone()],
    };
    let mut reversed = Directory {
        files: vec![file_b, file_a],
        directories: vec![subdir],
    };
    forward.canonicalize();
    reversed.canonicalize();
    assert_eq!(forward.digest().unwrap(), reversed.digest().unwrap());
}

#[test]
fn stage_ordering_is_monotonic() {
    assert!(Stage::Unknown < Stage::CacheCheck);
    assert!(Stage::CacheCheck < Stage::Queued);
    assert!(Stage::Queued < Stage::Executing);
    assert!(Stage::Executing < Stage::Completed);
}

#[test]
fn stripped_operation_drops_payload() {
    let response = crate::ExecuteResponse {
        result: crate::ActionResult {
            exit_code: 0,
            stdout_raw: b"a lot of output".to_vec(),
            ..crate::ActionResult::default()
        },
        cached_result: true,
        status: Status::ok(),
    };
    let operation = Operation::completed("operations/abc", response);
    let stripped = operation.stripped();
    assert_eq!(stripped.name, operation.name);
    assert_eq!(stripped.stage, Stage::Completed);
    assert!(stripped.done);
    assert!(stripped.cached_result);
    assert_eq!(stripped.response, None);
}

#[test]
fn blob_resource_round_trip() {
    let digest = Digest::of_bytes(b"blob");
    let name = Resource::blob(digest).to_string();
    assert_eq!(Resource::parse(&name).unwrap(), Resource::Blob { digest });
}

#[test]
fn upload_resource_round_trip() {
    let digest = Digest::of_bytes(b"blob");
    let resource = Resource::upload(digest);
    let parsed = Resource::parse(&resource.to_string()).unwrap();
    assert_eq!(parsed, resource);
}

#[test]
fn stream_resource_round_trip() {
    let parsed = Resource::parse("operations/xyz/streams/stderr");
    // Operation names may themselves contain no slashes in this layout; a two-segment name is
    // rejected rather than mis-parsed.
    parsed.unwrap_err();

    let parsed = Resource::parse("op-xyz/streams/stdout").unwrap();
    assert_eq!(
        parsed,
        Resource::OperationStream {
            operation_name: "op-xyz".to_owned(),
            kind: StreamKind::Stdout,
        }
    );
}

#[test]
fn malformed_resources_are_invalid_argument() {
    for name in ["", "blobs/nothex_5", "uploads/not-a-uuid/blobs/abc_5", "op/streams/stdin"] {
        let err = Resource::parse(name).unwrap_err();
        assert_eq!(err.code, Code::InvalidArgument, "for {name:?}");
    }
}

#[test]
fn write_session_happy_path() {
    let content = b"chunked content";
    let digest = Digest::of_bytes(content);
    let name = Resource::upload(digest).to_string();

    let mut session = WriteSession::new(&name).unwrap();
    let committed = session.write(Some(&name), 0, &content[..7], false).unwrap();
    assert_eq!(committed, 7);
    // The name may be omitted after the first chunk.
    let committed = session.write(None, 7, &content[7..], true).unwrap();
    assert_eq!(committed, content.len());
    assert!(session.is_finished());

    let (got_digest, bytes) = session.into_bytes().unwrap();
    assert_eq!(got_digest, digest);
    assert_eq!(&bytes[..], content);
}

#[test]
fn write_session_rejects_name_change() {
    let digest = Digest::of_bytes(b"content");
    let name = Resource::upload(digest).to_string();
    let other_name = Resource::upload(digest).to_string();

    let mut session = WriteSession::new(&name).unwrap();
    let err = session
        .write(Some(&other_name), 0, b"content", true)
        .unwrap_err();
    assert_eq!(err.code, Code::InvalidArgument);
}

#[test]
fn write_session_rejects_offset_gap() {
    let digest = Digest::of_bytes(b"content");
    let name = Resource::upload(digest).to_string();

    let mut session = WriteSession::new(&name).unwrap();
    session.write(Some(&name), 0, b"con", false).unwrap();
    let err = session.write(None, 5, b"tent", true).unwrap_err();
    assert_eq!(err.code, Code::InvalidArgument);
}

#[test]
fn write_session_verifies_digest() {
    let digest = Digest::of_bytes(b"expected content");
    let name = Resource::upload(digest).to_string();

    let mut session = WriteSession::new(&name).unwrap();
    let err = session.write(Some(&name), 0, b"other content", true).unwrap_err();
    assert_eq!(err.code, Code::InvalidArgument);
}

#[test]
fn write_session_rejects_download_resources() {
    let name = Resource::blob(Digest::of_bytes(b"content")).to_string();
    WriteSession::new(&name).unwrap_err();
}
