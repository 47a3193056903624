// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use bytes::Bytes;

use hashing::Digest;
use remexec::{
    Action, Command, Directory, DirectoryNode, FileNode, Platform, QueuedOperation,
};

///
/// Canned file content, addressable by digest.
///
#[derive(Clone)]
pub struct TestData {
    string: String,
}

impl TestData {
    pub fn empty() -> TestData {
        TestData::new("")
    }

    pub fn roland() -> TestData {
        TestData::new("European Burmese")
    }

    pub fn catnip() -> TestData {
        TestData::new("catnip")
    }

    pub fn robin() -> TestData {
        TestData::new("Pug")
    }

    pub fn fourty_chars() -> TestData {
        TestData::new(
            "0123456789012345678901234567890123456789",
        )
    }

    pub fn new(s: &str) -> TestData {
        TestData {
            string: s.to_owned(),
        }
    }

    pub fn bytes(&self) -> Bytes {
        Bytes::copy_from_slice(self.string.as_bytes())
    }

    pub fn digest(&self) -> Digest {
        Digest::of_bytes(self.string.as_bytes())
    }

    pub fn string(&self) -> String {
        self.string.clone()
    }

    pub fn len(&self) -> usize {
        self.string.len()
    }
}

///
/// Canned directories, with helpers for the index (digest → Directory closure) shape the farm
/// passes around.
///
#[derive(Clone)]
pub struct TestDirectory {
    pub directory: Directory,
    children: Vec<TestDirectory>,
}

impl TestDirectory {
    pub fn empty() -> TestDirectory {
        TestDirectory {
            directory: Directory::default(),
            children: vec![],
        }
    }

    /// A directory containing "roland" at the top level.
    pub fn containing_roland() -> TestDirectory {
        let mut directory = Directory::default();
        directory.files.push(FileNode {
            name: "roland".to_owned(),
            digest: TestData::roland().digest(),
            is_executable: false,
        });
        TestDirectory {
            directory,
            children: vec![],
        }
    }

    /// A directory containing an executable "run.sh".
    pub fn containing_script(script: &TestData) -> TestDirectory {
        let mut directory = Directory::default();
        directory.files.push(FileNode {
            name: "run.sh".to_owned(),
            digest: script.digest(),
            is_executable: true,
        });
        TestDirectory {
            directory,
            children: vec![],
        }
    }

    /// A directory containing "catnip" and "roland" at the top level.
    pub fn containing_roland_and_catnip() -> TestDirectory {
        let mut directory = Directory::default();
        directory.files.push(FileNode {
            name: "catnip".to_owned(),
            digest: TestData::catnip().digest(),
            is_executable: false,
        });
        directory.files.push(FileNode {
            name: "roland".to_owned(),
            digest: TestData::roland().digest(),
            is_executable: false,
        });
        TestDirectory {
            directory,
            children: vec![],
        }
    }

    /// A directory with a "cats" subdirectory containing "roland".
    pub fn nested() -> TestDirectory {
        let child = TestDirectory::containing_roland();
        let mut directory = Directory::default();
        directory.directories.push(DirectoryNode {
            name: "cats".to_owned(),
            digest: child.digest(),
        });
        TestDirectory {
            directory,
            children: vec![child],
        }
    }

    /// "robin" at the top, plus a "cats" subdirectory containing "roland".
    pub fn recursive() -> TestDirectory {
        let child = TestDirectory::containing_roland();
        let mut directory = Directory::default();
        directory.files.push(FileNode {
            name: "robin".to_owned(),
            digest: TestData::robin().digest(),
            is_executable: false,
        });
        directory.directories.push(DirectoryNode {
            name: "cats".to_owned(),
            digest: child.digest(),
        });
        TestDirectory {
            directory,
            children: vec![child],
        }
    }

    pub fn directory(&self) -> Directory {
        self.directory.clone()
    }

    pub fn digest(&self) -> Digest {
        self.directory.digest().unwrap()
    }

    pub fn bytes(&self) -> Bytes {
        remexec::encode(&self.directory).unwrap()
    }

    /// The transitive digest → Directory index for this tree.
    pub fn index(&self) -> HashMap<Digest, Directory> {
        let mut index = HashMap::new();
        self.add_to_index(&mut index);
        index
    }

    fn add_to_index(&self, index: &mut HashMap<Digest, Directory>) {
        index.insert(self.digest(), self.directory.clone());
        for child in &self.children {
            child.add_to_index(index);
        }
    }

    /// The (digest, Directory) list shape carried by QueuedOperations and the tree cache.
    pub fn directory_list(&self) -> Vec<(Digest, Directory)> {
        let mut list = vec![(self.digest(), self.directory.clone())];
        for child in &self.children {
            list.extend(child.directory_list());
        }
        list
    }

    /// Every file in the tree, as (digest, is_executable) reference pairs.
    pub fn file_references(&self) -> Vec<(Digest, bool)> {
        let mut references = self
            .directory
            .files
            .iter()
            .map(|file| (file.digest, file.is_executable))
            .collect::<Vec<_>>();
        for child in &self.children {
            references.extend(child.file_references());
        }
        references
    }

    /// The blobs backing every file in the tree. Only meaningful for trees built from the
    /// canned TestData contents.
    pub fn file_blobs(&self) -> HashMap<Digest, Bytes> {
        [
            TestData::roland(),
            TestData::catnip(),
            TestData::robin(),
            TestData::fourty_chars(),
        ]
        .into_iter()
        .map(|data| (data.digest(), data.bytes()))
        .collect()
    }
}

///
/// Alias kept for call sites that deal in output trees.
///
pub type TestTree = TestDirectory;

///
/// A complete, consistent Action/Command/input-tree bundle.
///
pub struct TestAction {
    pub command: Command,
    pub action: Action,
    pub input_root: TestDirectory,
}

impl TestAction {
    ///
    /// An action that would cat the roland file.
    ///
    pub fn cat_roland() -> TestAction {
        let input_root = TestDirectory::containing_roland();
        let command = Command {
            arguments: vec!["/bin/cat".to_owned(), "roland".to_owned()],
            environment_variables: BTreeMap::new(),
            output_files: vec![],
            output_directories: vec![],
            working_directory: String::new(),
            platform: Platform::default(),
        };
        TestAction::from_parts(command, input_root)
    }

    ///
    /// An action writing "meow" to out.txt.
    ///
    pub fn echo_to_output() -> TestAction {
        let input_root = TestDirectory::empty();
        let command = Command {
            arguments: vec![
                "/bin/sh".to_owned(),
                "-c".to_owned(),
                "printf meow > out.txt".to_owned(),
            ],
            environment_variables: BTreeMap::new(),
            output_files: vec!["out.txt".to_owned()],
            output_directories: vec![],
            working_directory: String::new(),
            platform: Platform::default(),
        };
        TestAction::from_parts(command, input_root)
    }

    pub fn from_parts(command: Command, input_root: TestDirectory) -> TestAction {
        let command_digest = remexec::encode_with_digest(&command).unwrap().0;
        let action = Action {
            command_digest,
            input_root_digest: input_root.digest(),
            timeout: Some(Duration::from_secs(60)),
            do_not_cache: false,
            platform: Platform::default(),
        };
        TestAction {
            command,
            action,
            input_root,
        }
    }

    pub fn action_digest(&self) -> Digest {
        remexec::encode_with_digest(&self.action).unwrap().0
    }

    pub fn action_bytes(&self) -> Bytes {
        remexec::encode(&self.action).unwrap()
    }

    pub fn command_digest(&self) -> Digest {
        self.action.command_digest
    }

    pub fn command_bytes(&self) -> Bytes {
        remexec::encode(&self.command).unwrap()
    }

    pub fn queued_operation(&self) -> QueuedOperation {
        QueuedOperation {
            action: self.action.clone(),
            command: self.command.clone(),
            directories: self.input_root.directory_list(),
        }
    }

    /// Every blob a CAS would need to hold for this action to be executable: the action, the
    /// command, the directories, and the file contents.
    pub fn all_blobs(&self) -> HashMap<Digest, Bytes> {
        let mut blobs = self.input_root.file_blobs();
        blobs.insert(self.action_digest(), self.action_bytes());
        blobs.insert(self.command_digest(), self.command_bytes());
        for (digest, directory) in self.input_root.directory_list() {
            blobs.insert(digest, remexec::encode(&directory).unwrap());
        }
        blobs
    }
}
