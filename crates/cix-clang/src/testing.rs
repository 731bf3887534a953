//! Scriptable façade implementations for tests.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use cix_core::{Cpp, Location, Source};
use cix_index::{IndexData, SymbolData, SymbolInfo, SymbolKind, SymbolTag};

use crate::{
    Completion, CompletionEngine, FacadeError, FileVisitor, Preprocessor, UnitIndexer,
};

/// Returns the source text wrapped in a marker, or a scripted failure.
#[derive(Default)]
pub struct FakePreprocessor {
    pub fail: bool,
}

impl Preprocessor for FakePreprocessor {
    fn preprocess(&self, source: &Source) -> Result<Cpp, FacadeError> {
        if self.fail {
            return Err(FacadeError::Preprocess("scripted failure".into()));
        }
        Ok(Cpp {
            preprocessed: format!("# 1 \"{}\"\n", source.source_file.display()),
            duration_ms: 1,
        })
    }
}

/// One scripted occurrence for [`FakeIndexer`].
#[derive(Clone, Debug)]
pub struct ScriptedSymbol {
    /// File path; each run asks the visitor about every distinct path.
    pub file: PathBuf,
    pub line: u32,
    pub column: u32,
    pub name: String,
    pub definition: bool,
    /// (file, line, column) this occurrence points at.
    pub target: Option<(PathBuf, u32, u32)>,
}

/// Produces a fixed `IndexData` per source file, asking the visitor about
/// every file it touches, the way a real indexer run does.
#[derive(Default)]
pub struct FakeIndexer {
    pub symbols: Mutex<Vec<ScriptedSymbol>>,
}

impl FakeIndexer {
    pub fn with_symbols(symbols: Vec<ScriptedSymbol>) -> Self {
        Self {
            symbols: Mutex::new(symbols),
        }
    }
}

impl UnitIndexer for FakeIndexer {
    fn index(
        &self,
        source: &Source,
        _cpp: &Cpp,
        visits: &mut dyn FileVisitor,
    ) -> Result<IndexData, FacadeError> {
        let mut data = IndexData {
            key: source.key(),
            parse_duration_ms: 1,
            ..IndexData::default()
        };

        let mut file_ids: BTreeMap<PathBuf, (cix_core::FileId, bool)> = BTreeMap::new();
        let mut resolve = |path: &PathBuf,
                           visits: &mut dyn FileVisitor,
                           data: &mut IndexData| {
            if let Some(&(id, _)) = file_ids.get(path) {
                return id;
            }
            let answer = visits.should_visit(path);
            data.visited.insert(answer.file_id, answer.visit);
            file_ids.insert(path.clone(), (answer.file_id, answer.visit));
            answer.file_id
        };

        let root = resolve(&source.source_file, visits, &mut data);
        data.dependencies.entry(root).or_default().insert(root);

        let symbols = self.symbols.lock().expect("fake indexer lock");
        for scripted in symbols.iter() {
            let file = resolve(&scripted.file, visits, &mut data);
            if !data.visited.get(&file).copied().unwrap_or(false) {
                continue;
            }
            if file != root {
                data.dependencies.entry(file).or_default().insert(root);
            }
            let location = Location::new(file, scripted.line, scripted.column);

            let mut record = SymbolData {
                symbol_length: scripted.name.len() as u16,
                symbol_name: scripted.name.clone(),
                kind: if scripted.definition {
                    SymbolKind::Function
                } else {
                    SymbolKind::Reference
                },
                tag: SymbolTag::Definition(scripted.definition),
                start: 0,
                end: scripted.name.len() as i32,
                ..SymbolData::new()
            };
            if let Some((target_file, line, column)) = &scripted.target {
                let target_id = resolve(target_file, visits, &mut data);
                let target = Location::new(target_id, *line, *column);
                record.targets.insert(target);
                // Stub record at the far end so merges stay symmetric.
                data.symbols
                    .entry(target)
                    .or_default()
                    .add_reference(location);
            }

            data.symbols
                .entry(location)
                .or_default()
                .unite(&SymbolInfo::new(record));
            data.symbol_names
                .entry(scripted.name.clone())
                .or_default()
                .insert(location);
        }

        Ok(data)
    }
}

/// Completion engine whose "parse" is the source path and whose candidates
/// are scripted.
pub struct FakeCompletionEngine {
    pub candidates: Vec<Completion>,
}

impl CompletionEngine for FakeCompletionEngine {
    type Unit = PathBuf;

    fn parse(&self, source: &Source, _unsaved: Option<&str>) -> Result<Self::Unit, FacadeError> {
        Ok(source.source_file.clone())
    }

    fn reparse(&self, _unit: &mut Self::Unit, _unsaved: Option<&str>) -> Result<(), FacadeError> {
        Ok(())
    }

    fn complete(
        &self,
        _unit: &mut Self::Unit,
        _line: u32,
        _column: u32,
        _unsaved: Option<&str>,
    ) -> Result<Vec<Completion>, FacadeError> {
        Ok(self.candidates.clone())
    }
}
