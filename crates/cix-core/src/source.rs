//! Compile invocations and their preprocessed artifacts.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::FileId;

/// The language a translation unit is compiled as.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceLanguage {
    None,
    C,
    CPlusPlus,
    CPlusPlus11,
    ObjectiveC,
    ObjectiveCPlusPlus,
    CHeader,
    CPlusPlusHeader,
}

impl SourceLanguage {
    /// Headers and unknown inputs are picked up through dependencies, never
    /// admitted as translation units themselves.
    pub fn is_indexable(self) -> bool {
        matches!(
            self,
            SourceLanguage::C
                | SourceLanguage::CPlusPlus
                | SourceLanguage::CPlusPlus11
                | SourceLanguage::ObjectiveC
                | SourceLanguage::ObjectiveCPlusPlus
        )
    }

    fn from_extension(ext: &str) -> SourceLanguage {
        match ext {
            "c" => SourceLanguage::C,
            "cc" | "cpp" | "cxx" | "C" | "c++" => SourceLanguage::CPlusPlus,
            "m" => SourceLanguage::ObjectiveC,
            "mm" => SourceLanguage::ObjectiveCPlusPlus,
            "h" => SourceLanguage::CHeader,
            "hh" | "hpp" | "hxx" | "h++" => SourceLanguage::CPlusPlusHeader,
            _ => SourceLanguage::None,
        }
    }
}

/// A 64-bit key identifying a unique compilation context:
/// `(source file id << 32) | build root id`.
pub type SourceKey = u64;

pub fn encode_key(file_id: FileId, build_root_id: FileId) -> SourceKey {
    ((file_id.to_raw() as u64) << 32) | build_root_id.to_raw() as u64
}

pub fn decode_key(key: SourceKey) -> (FileId, FileId) {
    (
        FileId::from_raw((key >> 32) as u32),
        FileId::from_raw(key as u32),
    )
}

/// One compile invocation: the unit of admission into the indexing pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub file_id: FileId,
    pub build_root_id: FileId,
    pub source_file: PathBuf,
    pub build_root: PathBuf,
    pub compiler: PathBuf,
    pub language: SourceLanguage,
    /// Compiler arguments with the source file, `-c` and `-o <out>` stripped.
    pub arguments: Vec<String>,
}

impl Source {
    pub fn key(&self) -> SourceKey {
        encode_key(self.file_id, self.build_root_id)
    }

    pub fn is_indexable(&self) -> bool {
        self.language.is_indexable() && self.file_id.is_valid()
    }

    /// Parse a compile command line relative to `cwd`.
    ///
    /// Returns `None` when no source file with a recognizable language is
    /// present. File ids are not assigned here; the caller interns
    /// `source_file` and `build_root` and fills them in.
    pub fn parse(arguments: &str, cwd: &Path) -> Option<Source> {
        let mut tokens = split_command_line(arguments);
        if tokens.is_empty() {
            return None;
        }
        let compiler = PathBuf::from(tokens.remove(0));

        let mut language = SourceLanguage::None;
        let mut source_file: Option<PathBuf> = None;
        let mut kept: Vec<String> = Vec::with_capacity(tokens.len());

        let mut iter = tokens.into_iter();
        while let Some(tok) = iter.next() {
            if tok == "-c" {
                continue;
            }
            if tok == "-o" {
                let _ = iter.next();
                continue;
            }
            if tok == "-x" {
                if let Some(lang) = iter.next() {
                    language = match lang.as_str() {
                        "c" => SourceLanguage::C,
                        "c++" => SourceLanguage::CPlusPlus,
                        "objective-c" => SourceLanguage::ObjectiveC,
                        "objective-c++" => SourceLanguage::ObjectiveCPlusPlus,
                        _ => SourceLanguage::None,
                    };
                    kept.push(tok);
                    kept.push(lang);
                }
                continue;
            }
            if !tok.starts_with('-') && source_file.is_none() {
                let ext = Path::new(&tok)
                    .extension()
                    .and_then(|e| e.to_str())
                    .unwrap_or("");
                let by_ext = SourceLanguage::from_extension(ext);
                if by_ext != SourceLanguage::None || language != SourceLanguage::None {
                    if language == SourceLanguage::None {
                        language = by_ext;
                    }
                    source_file = Some(absolute(Path::new(&tok), cwd));
                } else {
                    kept.push(tok);
                }
                continue;
            }
            if (tok == "-std=c++11" || tok == "-std=c++0x")
                && matches!(language, SourceLanguage::CPlusPlus | SourceLanguage::None)
            {
                language = SourceLanguage::CPlusPlus11;
            }
            kept.push(tok);
        }

        let source_file = source_file?;
        if !language.is_indexable() {
            return None;
        }

        Some(Source {
            file_id: FileId::NONE,
            build_root_id: FileId::NONE,
            source_file,
            build_root: cwd.to_path_buf(),
            compiler,
            language,
            arguments: kept,
        })
    }
}

fn absolute(path: &Path, cwd: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

/// Minimal shell-style tokenization: whitespace-separated, single and double
/// quotes group, backslash escapes the next character outside single quotes.
fn split_command_line(input: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut chars = input.chars().peekable();
    let mut in_token = false;

    while let Some(ch) = chars.next() {
        match ch {
            c if c.is_whitespace() => {
                if in_token {
                    out.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            '\'' => {
                in_token = true;
                for c in chars.by_ref() {
                    if c == '\'' {
                        break;
                    }
                    current.push(c);
                }
            }
            '"' => {
                in_token = true;
                while let Some(c) = chars.next() {
                    match c {
                        '"' => break,
                        '\\' => {
                            if let Some(next) = chars.next() {
                                current.push(next);
                            }
                        }
                        _ => current.push(c),
                    }
                }
            }
            '\\' => {
                in_token = true;
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            _ => {
                in_token = true;
                current.push(ch);
            }
        }
    }
    if in_token {
        out.push(current);
    }
    out
}

/// The preprocessed output of a [`Source`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cpp {
    pub preprocessed: String,
    pub duration_ms: u64,
}
