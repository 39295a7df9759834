//! The link pipeline.
//!
//! Loaded hunks flow through unreferenced-hunk removal, DLL renaming,
//! alignment overrides, import synthesis, ordering, the call
//! transform, compression with model and hash-size search, and
//! finalization into a self-extracting executable.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;

use crate::aritcode::BIT_PRECISION;
use crate::compress::{self, BASE_PROB};
use crate::error::Error;
use crate::exports::{self, Export};
use crate::finalize::{self, FinalizeParams, SUBSYSTEM_WINDOWS_CUI, SUBSYSTEM_WINDOWS_GUI};
use crate::hashopt;
use crate::hunk::{Hunk, Symbol, HUNK_IS_ALIGNED, HUNK_IS_CODE, SYMBOL_IS_SECTION};
use crate::hunklist::{relocate, HunkList};
use crate::imports;
use crate::log::Logger;
use crate::modellist::{CompressionTier, ModelList1k, ModelList4k};
use crate::modelsearch;
use crate::progress::{NullProgress, Progress};
use crate::reuse::{Reuse, ReuseType};
use crate::sorters::{self, EmpiricalContext};
use crate::stubs;
use crate::transform::CallTransform;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsystem {
    Console,
    Windows,
}

impl Subsystem {
    fn header_byte(self) -> u8 {
        match self {
            Subsystem::Console => SUBSYSTEM_WINDOWS_CUI,
            Subsystem::Windows => SUBSYSTEM_WINDOWS_GUI,
        }
    }
}

/// One flat image ready for compression.
struct Phase1 {
    flat: Hunk,
    untransformed: Hunk,
    split_point: usize,
    transform_ok: bool,
}

pub struct Linker {
    pool: HunkList,
    pub entry: String,
    pub subsystem: Subsystem,
    pub compression_tier: CompressionTier,
    /// Context-table budget in bytes.
    pub hash_size: u32,
    pub hash_tries: u32,
    pub hunk_tries: u32,
    /// `None` inherits (off for a fresh link).
    pub saturate: Option<bool>,
    pub large_address_aware: Option<bool>,
    pub tiny_header: bool,
    pub tiny_import: bool,
    pub safe_importing: bool,
    pub call_transform: bool,
    /// Mantissa bits to keep when rounding 8-byte floats.
    pub truncate_floats: Option<u32>,
    /// Alignment override in bits.
    pub override_alignments: Option<u32>,
    pub unalign_code: bool,
    pub run_initializers: bool,
    pub reuse_type: ReuseType,
    pub reuse_path: String,
    pub range_dlls: Vec<String>,
    pub replace_dlls: BTreeMap<String, String>,
    pub fallback_dlls: BTreeMap<String, String>,
    pub print_report: bool,
    exports: BTreeSet<Export>,
    models_code: ModelList4k,
    models_data: ModelList4k,
    models_1k: ModelList1k,
    logger: Logger,
    progress: Box<dyn Progress>,
}

impl Linker {
    pub fn new(logger: Logger) -> Self {
        Self {
            pool: HunkList::new(),
            entry: String::new(),
            subsystem: Subsystem::Windows,
            compression_tier: CompressionTier::Fast,
            hash_size: 100 * 1024 * 1024,
            hash_tries: 0,
            hunk_tries: 0,
            saturate: None,
            large_address_aware: None,
            tiny_header: false,
            tiny_import: false,
            safe_importing: true,
            call_transform: true,
            truncate_floats: None,
            override_alignments: None,
            unalign_code: false,
            run_initializers: true,
            reuse_type: ReuseType::Off,
            reuse_path: String::new(),
            range_dlls: Vec::new(),
            replace_dlls: BTreeMap::new(),
            fallback_dlls: BTreeMap::new(),
            print_report: false,
            exports: BTreeSet::new(),
            models_code: modelsearch::instant_models_4k(),
            models_data: modelsearch::instant_models_4k(),
            models_1k: ModelList1k::new(),
            logger,
            progress: Box::new(NullProgress),
        }
    }

    pub fn set_progress(&mut self, progress: Box<dyn Progress>) {
        self.progress = progress;
    }

    pub fn logger(&mut self) -> &mut Logger {
        &mut self.logger
    }

    /// Appends loaded hunks to the pool.
    pub fn add_hunks(&mut self, mut hunks: HunkList) {
        self.pool.append(&mut hunks);
    }

    pub fn add_export(&mut self, export: Export) {
        self.exports.insert(export);
    }

    pub fn exports(&self) -> &BTreeSet<Export> {
        &self.exports
    }

    /// The configured entry name, or the subsystem's conventional one.
    pub fn entry_symbol_name(&self) -> String {
        if !self.entry.is_empty() {
            return self.entry.clone();
        }
        match self.subsystem {
            Subsystem::Console => "mainCRTStartup".to_string(),
            Subsystem::Windows => "WinMainCRTStartup".to_string(),
        }
    }

    /// Echoes the effective configuration as an option string.
    pub fn print_options<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        write!(
            out,
            " /SUBSYSTEM:{}",
            match self.subsystem {
                Subsystem::Console => "CONSOLE",
                Subsystem::Windows => "WINDOWS",
            }
        )?;
        if self.large_address_aware == Some(true) {
            write!(out, " /LARGEADDRESSAWARE")?;
        }
        if !self.entry.is_empty() {
            write!(out, " /ENTRY:{}", self.entry)?;
        }
        if self.tiny_header {
            write!(out, " /TINYHEADER")?;
        }
        if self.tiny_import {
            write!(out, " /TINYIMPORT")?;
        }
        if !self.tiny_header {
            write!(out, " /COMPMODE:{}", self.compression_tier.name())?;
            if self.saturate == Some(true) {
                write!(out, " /SATURATE")?;
            }
            write!(out, " /HASHSIZE:{}", self.hash_size / 1048576)?;
        }
        if self.compression_tier != CompressionTier::Instant {
            if !self.tiny_header {
                write!(out, " /HASHTRIES:{}", self.hash_tries)?;
            }
            write!(out, " /ORDERTRIES:{}", self.hunk_tries)?;
        }
        for dll in &self.range_dlls {
            write!(out, " /RANGE:{}", dll)?;
        }
        for (from, to) in &self.replace_dlls {
            write!(out, " /REPLACEDLL:{}={}", from, to)?;
        }
        for (from, to) in &self.fallback_dlls {
            write!(out, " /FALLBACKDLL:{}={}", from, to)?;
        }
        if !self.tiny_header && !self.safe_importing {
            write!(out, " /UNSAFEIMPORT")?;
        }
        if self.call_transform {
            write!(out, " /TRANSFORM:CALLS")?;
        }
        if let Some(bits) = self.truncate_floats {
            write!(out, " /TRUNCATEFLOATS:{}", bits)?;
        }
        if let Some(bits) = self.override_alignments {
            write!(out, " /OVERRIDEALIGNMENTS:{}", bits)?;
        }
        if self.unalign_code {
            write!(out, " /UNALIGNCODE")?;
        }
        if !self.run_initializers {
            write!(out, " /NOINITIALIZERS")?;
        }
        for export in &self.exports {
            write!(out, " /EXPORT:{}", export)?;
        }
        Ok(())
    }

    /// Collects the relocation targets of `CRT$XCU` hunks into a hunk
    /// of call instructions run before the entry point.
    fn create_dynamic_initializer_hunk(&mut self) -> Option<Hunk> {
        let mut targets = Vec::new();
        for hunk in self.pool.iter() {
            if hunk.name().ends_with("CRT$XCU") {
                for relocation in &hunk.relocations {
                    targets.push(relocation.symbol.clone());
                }
            }
        }
        if targets.is_empty() {
            return None;
        }
        let mut hunk = Hunk::new(
            "dynamic initializer calls",
            HUNK_IS_CODE,
            0,
            vec![0; targets.len() * 5],
            0,
        );
        for (i, target) in targets.iter().enumerate() {
            hunk.data_mut()[i * 5] = 0xe8;
            hunk.add_relocation(crate::hunk::Relocation {
                offset: i * 5 + 1,
                symbol: target.clone(),
                kind: crate::hunk::RelocKind::Rel32,
            });
        }
        hunk.add_symbol(Symbol::new(
            "__DynamicInitializers",
            0,
            crate::hunk::SYMBOL_IS_RELOCATABLE,
        ));
        self.logger.info(
            "",
            &format!(
                "Included {} dynamic initializer{}",
                targets.len(),
                if targets.len() == 1 { "" } else { "s" }
            ),
        );
        Some(hunk)
    }

    /// Root set for reachability: the entry hunk, export targets and
    /// the symbols the import loader needs at run time.
    fn prune_pool(&mut self, entry_hunk: usize) -> Result<(), Error> {
        let mut roots = vec![entry_hunk];
        for export in self.exports.clone() {
            if export.has_value() {
                if let Some((_, symbol)) = self.pool.find_symbol(export.name()) {
                    if !symbol.from_library {
                        return Err(self.logger.error(
                            "",
                            Error::ExportCollision { name: export.name().to_string() },
                        ));
                    }
                }
            } else {
                let target = export.symbol().unwrap().to_string();
                match self.pool.find_symbol(&target) {
                    Some((hunk_index, symbol)) => {
                        let symbol_name = symbol.name.clone();
                        if self.pool[hunk_index].raw_size() == 0 {
                            let virtual_size = self.pool[hunk_index].virtual_size();
                            self.pool[hunk_index].set_raw_size(virtual_size);
                            let hunk_name = self.pool[hunk_index].name().to_string();
                            self.logger.warning(
                                "",
                                &format!(
                                    "Uninitialized hunk '{}' forced to data section because of exported symbol '{}'",
                                    hunk_name, symbol_name
                                ),
                            );
                        }
                        roots.push(hunk_index);
                    }
                    None => {
                        return Err(self.logger.error(
                            "",
                            Error::ExportSymbolNotFound {
                                name: target,
                                export: export.name().to_string(),
                            },
                        ));
                    }
                }
            }
        }
        for name in ["__imp__LoadLibraryA@4", "__imp__MessageBoxA@16", "__DynamicInitializers"] {
            if name == "__imp__MessageBoxA@16" && (!self.safe_importing || self.tiny_import) {
                continue;
            }
            if let Some((hunk_index, _)) = self.pool.find_symbol(name) {
                roots.push(hunk_index);
            }
        }
        self.pool.remove_unreferenced_hunks(&roots);
        Ok(())
    }

    /// The import loader always resolves these two; make sure their
    /// thunks exist even if no input object imported them.
    fn ensure_loader_imports(&mut self) {
        let mut needed = vec![("__imp__LoadLibraryA@4", "LoadLibraryA")];
        if self.safe_importing && !self.tiny_import {
            needed.push(("__imp__MessageBoxA@16", "MessageBoxA"));
        }
        for (symbol, function) in needed {
            if self.pool.find_symbol(symbol).is_none() {
                let mut hunk = Hunk::new_import(symbol, function, "kernel32");
                if symbol.contains("MessageBox") {
                    hunk.import_dll = "user32".to_string();
                }
                hunk.add_symbol(Symbol::new(symbol, 0, 0));
                self.pool.push_back(hunk);
            }
        }
    }

    fn unalign_entry_and_code(&mut self, entry_hunk: usize) {
        let mut unaligned = 0;
        let mut entry_unaligned = false;
        if self.pool[entry_hunk].alignment_bits() > 0 {
            self.pool[entry_hunk].set_alignment_bits(0);
            unaligned += 1;
            entry_unaligned = true;
        }
        if self.unalign_code {
            for hunk in self.pool.iter_mut() {
                if hunk.flags & HUNK_IS_CODE != 0
                    && hunk.flags & HUNK_IS_ALIGNED == 0
                    && hunk.alignment_bits() > 0
                {
                    hunk.set_alignment_bits(0);
                    unaligned += 1;
                }
            }
        }
        if unaligned > 0 {
            self.logger.info(
                "",
                &format!(
                    "Forced alignment of {} code hunk{} to 1{}",
                    unaligned,
                    if unaligned == 1 { "" } else { "s" },
                    if entry_unaligned { " (including entry point)" } else { "" },
                ),
            );
        }
    }

    /// Flattens the pool at the code base and applies the call
    /// transform. When the transform finds nothing it disables itself
    /// and the caller relinks.
    fn link_and_transform(&mut self, transform: &mut CallTransform) -> Result<Phase1, Error> {
        let mut list = self.pool.clone();
        if transform.is_enabled() {
            list.push_front(stubs::calltrans_stub());
        }
        let (mut flat, placements) = list.flatten("linked");
        let split_point = HunkList::split_point(&placements);
        relocate(&mut flat, crate::CODE_BASE).map_err(|err| self.logger.error("", err))?;
        let untransformed = flat.clone();
        let transform_ok = if transform.is_enabled() {
            transform.apply(&mut flat, split_point, &mut self.logger)
        } else {
            true
        };
        Ok(Phase1 { flat, untransformed, split_point, transform_ok })
    }

    /// Searches for model lists on the current image, keeping any that
    /// beat the given targets. Returns the ideal total size.
    fn estimate_models(
        &mut self,
        data: &[u8],
        split_point: usize,
        reestimate: bool,
        targets: (u64, u64),
    ) -> u64 {
        let saturate = self.saturate.unwrap_or(false);
        if self.tiny_header {
            self.progress
                .begin_task(if reestimate { "Reestimating models" } else { "Estimating models" });
            let (models, size) = modelsearch::approximate_models_1k(data, self.progress.as_ref());
            self.progress.end_task();
            if size < targets.0 {
                self.models_1k = models;
            }
            let size = size.min(targets.0);
            self.logger.info(
                "",
                &format!("Estimated compressed size: {:.2}", fractional_bytes(size)),
            );
            return size;
        }
        self.progress.begin_task(if reestimate {
            "Reestimating models for code"
        } else {
            "Estimating models for code"
        });
        let (code_models, code_size) = modelsearch::approximate_models_4k(
            data,
            0,
            split_point,
            self.compression_tier,
            saturate,
            BASE_PROB,
            self.progress.as_ref(),
        );
        self.progress.end_task();
        if code_size < targets.0 {
            self.models_code = code_models;
        }
        self.logger.info(
            "",
            &format!(
                "Estimated compressed size of code: {:.2}",
                fractional_bytes(code_size.min(targets.0))
            ),
        );
        self.progress.begin_task(if reestimate {
            "Reestimating models for data"
        } else {
            "Estimating models for data"
        });
        let (data_models, data_size) = modelsearch::approximate_models_4k(
            data,
            split_point,
            data.len() - split_point,
            self.compression_tier,
            saturate,
            BASE_PROB,
            self.progress.as_ref(),
        );
        self.progress.end_task();
        if data_size < targets.1 {
            self.models_data = data_models;
        }
        self.logger.info(
            "",
            &format!(
                "Estimated compressed size of data: {:.2}",
                fractional_bytes(data_size.min(targets.1))
            ),
        );
        let (ideal, per_segment) = compress::evaluate_size_4k(
            data,
            &[split_point, data.len() - split_point],
            &[&self.models_code, &self.models_data],
            BASE_PROB,
            saturate,
            None,
        );
        self.logger.info(
            "",
            &format!("Ideal compressed size of code: {:.2}", fractional_bytes(per_segment[0])),
        );
        self.logger.info(
            "",
            &format!("Ideal compressed size of data: {:.2}", fractional_bytes(per_segment[1])),
        );
        self.logger
            .info("", &format!("Ideal compressed total size: {:.2}", fractional_bytes(ideal)));
        ideal
    }

    /// Links the pool into a finished executable image.
    pub fn link(&mut self) -> Result<Vec<u8>, Error> {
        let entry_name = self.entry_symbol_name();
        let (entry_hunk, entry_value) = match self.pool.find_undecorated_symbol(&entry_name) {
            Some((hunk_index, symbol)) => (hunk_index, symbol.value),
            None => {
                return Err(self
                    .logger
                    .error("", Error::EntryNotFound { name: entry_name }));
            }
        };
        let entry_symbol = self
            .pool
            .find_undecorated_symbol(&entry_name)
            .map(|(_, s)| s.name.clone())
            .unwrap();
        if entry_value > 0 {
            self.logger
                .warning("", "Entry point not at start of section, jump necessary");
        }

        let dynamic_initializers = if self.run_initializers {
            self.create_dynamic_initializer_hunk()
        } else {
            None
        };
        if let Some(hunk) = dynamic_initializers {
            self.pool.push_back(hunk);
        }

        self.ensure_loader_imports();
        self.prune_pool(entry_hunk)?;
        imports::replace_dlls(&mut self.pool, &self.replace_dlls, &mut self.logger);
        if let Some(bits) = self.override_alignments {
            for hunk in self.pool.iter_mut() {
                hunk.override_alignment(bits);
            }
        }
        let entry_hunk = self
            .pool
            .find_undecorated_symbol(&entry_name)
            .map(|(i, _)| i)
            .ok_or(Error::EntryNotFound { name: entry_name.clone() })?;
        self.unalign_entry_and_code(entry_hunk);

        // The header blob determines where the import hash block lands.
        let header = if self.tiny_header { stubs::header_1k() } else { stubs::header_4k() };
        let hashes_address = crate::IMAGE_BASE + header.raw_size() as u32;

        if !self.fallback_dlls.is_empty() && !self.safe_importing {
            return Err(self.logger.error("", Error::FallbackWithoutSafeImport));
        }
        let mut hash_hunk = None;
        let mut tiny_import_patches = None;
        if self.tiny_import {
            let tiny = imports::create_import_hunks_1k(&self.pool, &mut self.logger)?;
            self.pool.remove_import_hunks();
            let mut list = tiny.import_list;
            self.pool.append(&mut list);
            self.pool.push_back(stubs::import_loader_1k());
            tiny_import_patches = Some((tiny.hash_bits, tiny.max_dll_name_length));
        } else {
            let synthesised = imports::create_import_hunks(
                &self.pool,
                hashes_address,
                &self.range_dlls,
                &self.fallback_dlls,
                &mut self.logger,
            )?;
            self.pool.remove_import_hunks();
            let mut list = synthesised.import_list;
            self.pool.append(&mut list);
            self.pool.push_back(stubs::import_loader_stub(
                self.safe_importing,
                !self.fallback_dlls.is_empty(),
                synthesised.uses_range_import,
            ));
            hash_hunk = Some(synthesised.hash_hunk);
        }

        // Chain: import loader, then initializers, then the entry.
        let import_index = self.pool.find_symbol("_Import").map(|(i, _)| i);
        let mut import_hunk = match import_index {
            Some(index) => self.pool.remove(index),
            None => {
                return Err(self
                    .logger
                    .error("", Error::SymbolNotFound { name: "_Import".into() }));
            }
        };
        if let Some(index) = self.pool.position("dynamic initializer calls") {
            let mut initializers = self.pool.remove(index);
            initializers.continuation = Some(entry_symbol.clone());
            self.pool.push_front(initializers);
            import_hunk.continuation = Some("__DynamicInitializers".to_string());
        } else {
            import_hunk.continuation = Some(entry_symbol.clone());
        }
        import_hunk.set_alignment_bits(0);
        import_hunk.add_symbol(Symbol::new("_ImageBase", crate::IMAGE_BASE, 0));
        import_hunk.add_symbol(Symbol::new("___ImageBase", crate::IMAGE_BASE, 0));
        self.pool.push_front(import_hunk);

        if let Some((hash_bits, max_name_length)) = tiny_import_patches {
            for hunk in self.pool.iter_mut() {
                if let Some(symbol) = hunk.find_symbol(imports::SYM_HASH_SHIFT) {
                    let offset = symbol.value as usize;
                    hunk.data_mut()[offset] = (32 - hash_bits) as u8;
                }
                if let Some(symbol) = hunk.find_symbol(imports::SYM_MAX_NAME_LENGTH) {
                    let offset = symbol.value as usize;
                    hunk.data_mut()[offset] = max_name_length as u8;
                }
            }
        }

        if let Some(bits) = self.truncate_floats {
            let rounded = self.pool.round_floats(bits);
            self.logger
                .info("", &format!("Truncating floats: {} lanes rounded", rounded));
        }

        if !self.exports.is_empty() && !self.tiny_header {
            self.pool
                .push_back(exports::create_export_table(&self.exports, crate::IMAGE_BASE));
        }

        sorters::heuristic_sort(&mut self.pool);

        let mut best_hashsize = hashopt::previous_prime(self.hash_size / 2).saturating_mul(2);
        let mut reuse = None;
        let reuse_type = if self.tiny_header { ReuseType::Off } else { self.reuse_type };
        if reuse_type == ReuseType::Stable || reuse_type == ReuseType::Improve {
            reuse = Reuse::load(&self.reuse_path)?;
            if let Some(reuse) = &reuse {
                self.models_code = reuse.code_models().clone();
                self.models_data = reuse.data_models().clone();
                sorters::explicit_sort(&mut self.pool, reuse);
                best_hashsize = reuse.hash_size();
                self.logger
                    .info("", &format!("Read reuse file: {}", self.reuse_path));
            }
        }

        self.pool[0].add_symbol(Symbol::new(
            stubs::SYM_HEADER_HASHES,
            hashes_address,
            SYMBOL_IS_SECTION,
        ));

        let mut transform = CallTransform::new(self.call_transform && !self.tiny_header);
        let mut phase1 = self.link_and_transform(&mut transform)?;
        if !phase1.transform_ok && self.call_transform {
            // The transform disabled itself; relink clean.
            phase1 = self.link_and_transform(&mut transform)?;
        }
        let saturate = self.saturate.unwrap_or(false);

        let mut reuse_filesize = None;
        if reuse_type == ReuseType::Improve && reuse.is_some() {
            let packed = self.compress_phase1(&phase1, best_hashsize, None);
            let image = self.finalize_image(&header, hash_hunk.clone(), &phase1, &packed, best_hashsize)?;
            self.logger.info(
                "",
                &format!("File size with reuse parameters: {}", image.raw_size()),
            );
            reuse_filesize = Some(image.raw_size());
        }

        self.logger.info(
            "",
            &format!("Uncompressed size of code: {:5}", phase1.split_point),
        );
        self.logger.info(
            "",
            &format!(
                "Uncompressed size of data: {:5}",
                phase1.flat.raw_size() - phase1.split_point
            ),
        );

        if self.tiny_header || self.compression_tier != CompressionTier::Instant {
            if reuse_type == ReuseType::Stable && reuse.is_some() {
                let (ideal, per_segment) = compress::evaluate_size_4k(
                    phase1.flat.data(),
                    &[phase1.split_point, phase1.flat.raw_size() - phase1.split_point],
                    &[&self.models_code, &self.models_data],
                    BASE_PROB,
                    saturate,
                    None,
                );
                self.logger.info(
                    "",
                    &format!(
                        "Ideal compressed size of code: {:.2}",
                        fractional_bytes(per_segment[0])
                    ),
                );
                self.logger.info(
                    "",
                    &format!(
                        "Ideal compressed size of data: {:.2}",
                        fractional_bytes(per_segment[1])
                    ),
                );
                self.logger.info(
                    "",
                    &format!("Ideal compressed total size: {:.2}", fractional_bytes(ideal)),
                );
            } else {
                self.estimate_models(
                    phase1.flat.data(),
                    phase1.split_point,
                    false,
                    (u64::MAX, u64::MAX),
                );

                if self.hunk_tries > 0 {
                    let ctx = EmpiricalContext {
                        transform: &transform,
                        models_code: &self.models_code,
                        models_data: &self.models_data,
                        models_1k: &self.models_1k,
                        baseprob: BASE_PROB,
                        saturate,
                        tiny_mode: self.tiny_header,
                    };
                    let targets =
                        sorters::empirical_sort(&mut self.pool, &ctx, self.hunk_tries, self.progress.as_ref());
                    phase1 = self.link_and_transform(&mut transform)?;
                    if !phase1.transform_ok && transform.is_enabled() {
                        phase1 = self.link_and_transform(&mut transform)?;
                    }
                    self.estimate_models(phase1.flat.data(), phase1.split_point, true, targets);
                }

                if !self.tiny_header && self.hash_tries > 0 {
                    let hash_bits = compress::compute_hash_bits(
                        phase1.flat.data(),
                        &[phase1.split_point, phase1.flat.raw_size() - phase1.split_point],
                        &[&self.models_code, &self.models_data],
                    );
                    let start = hashopt::previous_prime(self.hash_size / 2).saturating_mul(2);
                    let (winner, _) = hashopt::optimize_hash_size(
                        &hash_bits,
                        start,
                        self.hash_tries,
                        saturate,
                        BASE_PROB,
                        self.progress.as_ref(),
                    );
                    best_hashsize = winner;
                }
            }
        }

        let mut sizefill = Vec::new();
        let packed = self.compress_phase1(&phase1, best_hashsize, Some(&mut sizefill));
        let image = self.finalize_image(&header, hash_hunk, &phase1, &packed, best_hashsize)?;

        if self.print_report {
            let report =
                crate::report::compression_report(&phase1.untransformed, &sizefill, phase1.split_point);
            let mut out = Vec::new();
            let _ = crate::report::print_report(&mut out, &report);
            self.logger.info("", &String::from_utf8_lossy(&out));
        }

        self.logger
            .info("", &format!("Final file size: {}", image.raw_size()));

        if reuse_type != ReuseType::Off {
            let write = match (reuse.is_some(), reuse_type, reuse_filesize) {
                (false, _, _) => true,
                (true, ReuseType::Improve, Some(previous)) => image.raw_size() < previous,
                _ => false,
            };
            if write {
                self.logger
                    .info("", &format!("Writing reuse file: {}", self.reuse_path));
                let record = Reuse::new(
                    &self.models_code,
                    &self.models_data,
                    &self.pool,
                    best_hashsize,
                );
                record.save(&self.reuse_path)?;
            }
        }

        Ok(image.data().to_vec())
    }

    fn compress_phase1(
        &mut self,
        phase1: &Phase1,
        hashsize: u32,
        sizefill: Option<&mut Vec<u32>>,
    ) -> Vec<u8> {
        if self.tiny_header {
            compress::compress_1k(phase1.flat.data(), &self.models_1k, sizefill)
        } else {
            compress::compress_4k(
                phase1.flat.data(),
                &[phase1.split_point, phase1.flat.raw_size() - phase1.split_point],
                &[&self.models_code, &self.models_data],
                self.saturate.unwrap_or(false),
                BASE_PROB,
                hashsize,
                sizefill,
            )
        }
    }

    fn finalize_image(
        &mut self,
        header: &Hunk,
        hash_hunk: Option<Hunk>,
        phase1: &Phase1,
        packed: &[u8],
        hashsize: u32,
    ) -> Result<Hunk, Error> {
        let exports_rva = if self.tiny_header || self.exports.is_empty() {
            0
        } else {
            match phase1.flat.find_symbol(exports::SYM_EXPORT_TABLE) {
                Some(symbol) => symbol.value + crate::CODE_BASE - crate::IMAGE_BASE,
                None => 0,
            }
        };
        let params = FinalizeParams {
            code_models: &self.models_code,
            data_models: &self.models_data,
            models_1k: &self.models_1k,
            split_point: phase1.split_point,
            hashsize,
            subsystem: self.subsystem.header_byte(),
            large_address_aware: self.large_address_aware.unwrap_or(false),
            saturate: self.saturate.unwrap_or(false),
            exports_rva,
            tiny_header: self.tiny_header,
        };
        finalize::final_link(header.clone(), None, hash_hunk, &phase1.flat, packed, &params)
            .map_err(|err| self.logger.error("", err))
    }
}

fn fractional_bytes(size: u64) -> f64 {
    size as f64 / (f64::from(BIT_PRECISION) * 8.0)
}
