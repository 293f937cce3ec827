//! kirin - version control for data files
//!
//! This crate stores datasets of files the way git stores source trees:
//! every file version is a content-addressed blob, every change is an
//! immutable commit holding a full name → hash snapshot, and branches are
//! mutable pointers into the commit graph. Merges between branches support
//! several conflict strategies, and a reverse index answers "which datasets
//! contain this content".
//!
//! # Example
//!
//! ```no_run
//! use kirin::db::Store;
//! use kirin::storage::NewFile;
//!
//! let store = Store::open("./data").unwrap();
//! let mut sales = store.open_or_create_dataset("sales").unwrap();
//! let file = NewFile::new("q1.csv", "region,total\nnorth,10\n").unwrap();
//! sales.commit("first load", &[file], &[]).unwrap();
//! assert_eq!(sales.list_files().unwrap().len(), 1);
//! ```

pub mod db;
pub mod storage;
