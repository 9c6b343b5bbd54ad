//! Streaming filter over multi-document YAML manifests
//!
//! A rendered release manifest is a concatenation of YAML documents separated
//! by `---` lines. [`ManifestFilter`] reads such a stream incrementally, parses
//! only the `apiVersion`/`kind` header of each document and lets a predicate
//! decide whether the document is kept. Kept documents are reproduced byte for
//! byte, including the separator line that introduced them.
//!
//! The filter works on raw bytes and only decodes complete documents, so a
//! multi-byte UTF-8 sequence split across two reads of the underlying reader
//! never reaches the YAML parser in pieces.
//!
//! # Example
//!
//! ```
//! use std::io::Read;
//! use kubesync_core::{DocumentFilter, filter_manifest};
//!
//! let manifest = "kind: ConfigMap\napiVersion: v1\n---\nkind: Job\napiVersion: batch/v1\n";
//! let jobs = DocumentFilter::kinds(["Job"]);
//!
//! let mut out = String::new();
//! filter_manifest(manifest.as_bytes(), |meta| jobs.accepts(meta))
//!     .read_to_string(&mut out)
//!     .unwrap();
//! assert_eq!(out, "---\nkind: Job\napiVersion: batch/v1\n");
//! ```

use std::io::{self, Read};

use serde::Deserialize;

use crate::error::{CoreError, Result};

/// Read size used by [`filter_manifest`]
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Header of a manifest document
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMeta {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
}

impl DocumentMeta {
    /// Parse the header of a single document, ignoring every other field
    pub fn parse(document: &[u8]) -> Result<Self> {
        Ok(serde_yaml::from_slice(document)?)
    }

    /// API group ("" for the core group)
    pub fn group(&self) -> &str {
        self.api_version
            .rsplit_once('/')
            .map(|(group, _)| group)
            .unwrap_or("")
    }

    /// API version without the group
    pub fn version(&self) -> &str {
        self.api_version
            .rsplit_once('/')
            .map(|(_, version)| version)
            .unwrap_or(&self.api_version)
    }
}

/// Predicate builder selecting documents by group, version and kind
///
/// Empty criteria match everything. Documents whose header cannot be parsed
/// are dropped unless [`DocumentFilter::keep_unparsable`] is set.
#[derive(Debug, Clone, Default)]
pub struct DocumentFilter {
    kinds: Vec<String>,
    groups: Vec<String>,
    versions: Vec<String>,
    exclude: bool,
    keep_unparsable: bool,
}

impl DocumentFilter {
    /// Keep documents of the given kinds
    pub fn kinds<I, S>(kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::default().with_kinds(kinds)
    }

    /// Keep documents in the given API groups ("" is the core group)
    pub fn groups<I, S>(groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::default().with_groups(groups)
    }

    /// Keep documents with the given API versions (without group)
    pub fn versions<I, S>(versions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::default().with_versions(versions)
    }

    pub fn with_kinds<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.kinds.extend(kinds.into_iter().map(Into::into));
        self
    }

    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups.extend(groups.into_iter().map(Into::into));
        self
    }

    pub fn with_versions<I, S>(mut self, versions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.versions.extend(versions.into_iter().map(Into::into));
        self
    }

    /// Invert the match: drop the selected documents and keep the rest
    pub fn excluding(mut self) -> Self {
        self.exclude = true;
        self
    }

    /// Keep documents whose header failed to parse
    pub fn keep_unparsable(mut self, keep: bool) -> Self {
        self.keep_unparsable = keep;
        self
    }

    /// Decide whether a document is kept
    pub fn accepts(&self, meta: std::result::Result<&DocumentMeta, &CoreError>) -> bool {
        let Ok(meta) = meta else {
            return self.keep_unparsable;
        };

        let matches = (self.kinds.is_empty() || self.kinds.iter().any(|k| *k == meta.kind))
            && (self.groups.is_empty() || self.groups.iter().any(|g| g == meta.group()))
            && (self.versions.is_empty() || self.versions.iter().any(|v| v == meta.version()));

        matches != self.exclude
    }
}

/// Filter a manifest stream with the default read size
pub fn filter_manifest<R, P>(reader: R, predicate: P) -> ManifestFilter<R, P>
where
    R: Read,
    P: FnMut(std::result::Result<&DocumentMeta, &CoreError>) -> bool,
{
    ManifestFilter::with_buffer_size(reader, DEFAULT_BUFFER_SIZE, predicate)
}

/// A reader yielding only the documents accepted by a predicate
///
/// Whitespace-only and comment-only documents are dropped without consulting
/// the predicate. Header parse errors are handed to the predicate, which
/// decides whether the document survives.
pub struct ManifestFilter<R, P> {
    reader: R,
    predicate: P,
    chunk: Vec<u8>,
    line: Vec<u8>,
    separator: Vec<u8>,
    body: Vec<u8>,
    output: Vec<u8>,
    position: usize,
    finished: bool,
}

impl<R, P> ManifestFilter<R, P>
where
    R: Read,
    P: FnMut(std::result::Result<&DocumentMeta, &CoreError>) -> bool,
{
    /// Create a filter reading `buffer_size` bytes at a time from `reader`
    ///
    /// The size only affects how the input is consumed; lines longer than the
    /// buffer are accumulated across reads.
    pub fn with_buffer_size(reader: R, buffer_size: usize, predicate: P) -> Self {
        Self {
            reader,
            predicate,
            chunk: vec![0; buffer_size.max(1)],
            line: Vec::new(),
            separator: Vec::new(),
            body: Vec::new(),
            output: Vec::new(),
            position: 0,
            finished: false,
        }
    }

    /// Consume one chunk of the underlying reader
    fn fill(&mut self) -> io::Result<()> {
        let mut chunk = std::mem::take(&mut self.chunk);
        let read = match self.reader.read(&mut chunk) {
            Ok(read) => read,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                self.chunk = chunk;
                return Ok(());
            }
            Err(e) => {
                self.chunk = chunk;
                return Err(e);
            }
        };

        if read == 0 {
            self.chunk = chunk;
            if !self.line.is_empty() {
                let line = std::mem::take(&mut self.line);
                self.push_line(line);
            }
            self.finish_document();
            self.finished = true;
            return Ok(());
        }

        let mut rest = &chunk[..read];
        while let Some(newline) = rest.iter().position(|b| *b == b'\n') {
            self.line.extend_from_slice(&rest[..=newline]);
            let line = std::mem::take(&mut self.line);
            self.push_line(line);
            rest = &rest[newline + 1..];
        }
        self.line.extend_from_slice(rest);

        self.chunk = chunk;
        Ok(())
    }

    fn push_line(&mut self, line: Vec<u8>) {
        if is_separator(&line) {
            self.finish_document();
            self.separator = line;
        } else {
            self.body.extend_from_slice(&line);
        }
    }

    /// Decide the fate of the document collected so far
    fn finish_document(&mut self) {
        let separator = std::mem::take(&mut self.separator);
        let body = std::mem::take(&mut self.body);

        if is_blank_document(&body) {
            return;
        }

        let meta = DocumentMeta::parse(&body);
        if (self.predicate)(meta.as_ref()) {
            self.output.extend_from_slice(&separator);
            self.output.extend_from_slice(&body);
        }
    }
}

impl<R, P> Read for ManifestFilter<R, P>
where
    R: Read,
    P: FnMut(std::result::Result<&DocumentMeta, &CoreError>) -> bool,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            let pending = &self.output[self.position..];
            if !pending.is_empty() {
                let n = pending.len().min(buf.len());
                buf[..n].copy_from_slice(&pending[..n]);
                self.position += n;
                if self.position == self.output.len() {
                    self.output.clear();
                    self.position = 0;
                }
                return Ok(n);
            }

            if self.finished {
                return Ok(0);
            }

            self.fill()?;
        }
    }
}

/// Split a manifest into its non-empty documents (separators excluded)
pub fn split_documents(manifest: &str) -> Vec<&str> {
    let mut documents = Vec::new();
    let mut start = 0;
    let mut offset = 0;

    for line in manifest.split_inclusive('\n') {
        if is_separator(line.as_bytes()) {
            let document = &manifest[start..offset];
            if !is_blank_document(document.as_bytes()) {
                documents.push(document);
            }
            start = offset + line.len();
        }
        offset += line.len();
    }

    let document = &manifest[start..];
    if !is_blank_document(document.as_bytes()) {
        documents.push(document);
    }

    documents
}

/// True when a document holds nothing but whitespace and comments
pub fn is_blank_document(document: &[u8]) -> bool {
    document.split(|b| *b == b'\n').all(|line| {
        let line = line.trim_ascii_start();
        line.is_empty() || line.starts_with(b"#")
    })
}

/// A `---` line, optionally followed by whitespace or a comment
fn is_separator(line: &[u8]) -> bool {
    let Some(rest) = line.strip_prefix(b"---") else {
        return false;
    };
    let rest = rest.trim_ascii_end();
    if rest.is_empty() {
        return true;
    }
    rest.first().is_some_and(|b| *b == b' ' || *b == b'\t')
        && rest.trim_ascii_start().starts_with(b"#")
}
