//! # Ingest Pipeline
//!
//! Routes per-position distance observations into chromosome blocks and the
//! whole-genome summary.
//!
//! ## Lifecycle
//! `Uninitialized -> Active -> Finalizing -> Closed`. The first observation
//! fixes the sample set and creates the summary store; every later one must
//! agree on the sample count.
//!
//! ## Locking
//! - one coarse mutex for run counters and chromosome creation
//! - one mutex per chromosome, so workers with disjoint chromosomes never
//!   contend on block accumulation
//! - the summary block is shared by every worker and accumulated through
//!   the atomic path under a read lock

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use tracing::{debug, info, info_span, instrument};

use crate::config::RunParameters;
use crate::data::block::{Block, BlockInfo};
use crate::data::block_manager::BlockManager;
use crate::data::chromosome::Chromosome;
use crate::data::samples::Samples;
use crate::data::storage::{CounterWidth, DistanceMatrix};
use crate::error::{IbError, Result};
use crate::io::ledger::LedgerWriter;
use crate::pipelines::database::{
    chromosome_store_path, column_of, found, ledger_path, metadata_path, summary_store_path,
    ChromosomeLayout, DatabaseMetadata, DistanceQueries,
};
use crate::utils::telemetry::{Stage, TelemetryBlackboard};
use crate::utils::threading::{build_thread_pool, resolve_threads};

const SUMMARY_DOMAIN: &str = "summary";

/// One SNP's contribution: distances between every pair of samples
#[derive(Clone, Debug)]
pub struct Observation {
    pub chromosome_name: String,
    pub chromosome_number: u64,
    pub position: u64,
    pub distances: DistanceMatrix,
}

impl Observation {
    pub fn new(
        chromosome_name: impl Into<String>,
        chromosome_number: u64,
        position: u64,
        distances: DistanceMatrix,
    ) -> Self {
        Self {
            chromosome_name: chromosome_name.into(),
            chromosome_number,
            position,
            distances,
        }
    }

    /// Build a dense delta from sparse `(i, j, value)` triples. Repeated
    /// pairs add up.
    pub fn from_pairs(
        chromosome_name: impl Into<String>,
        chromosome_number: u64,
        position: u64,
        num_samples: u64,
        width: CounterWidth,
        pairs: impl IntoIterator<Item = (u64, u64, u64)>,
    ) -> Result<Self> {
        let chromosome_name = chromosome_name.into();
        let mut distances =
            DistanceMatrix::new(chromosome_name.clone(), 0, num_samples, 0, 0, width);
        for (i, j, value) in pairs {
            distances.increment(i, j, value)?;
        }
        Ok(Self::new(chromosome_name, chromosome_number, position, distances))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Uninitialized,
    Active,
    Finalizing,
    Closed,
}

/// Run totals, as of the moment they were read
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunCounters {
    pub num_samples: u64,
    pub num_snps: u64,
    pub num_blocks: u64,
    /// Registers across all stores, the summary's included
    pub num_registers: u64,
}

#[derive(Debug)]
struct CoordinatorState {
    run_state: RunState,
    samples: Option<Samples>,
    counters: RunCounters,
    chromosome_order: Vec<String>,
    chromosome_numbers: HashMap<String, u64>,
}

pub struct IngestCoordinator {
    out_prefix: PathBuf,
    params: RunParameters,
    state: Mutex<CoordinatorState>,
    chromosomes: RwLock<HashMap<String, Arc<Mutex<Chromosome>>>>,
    summary: RwLock<Option<BlockManager>>,
    telemetry: Option<Arc<TelemetryBlackboard>>,
}

impl IngestCoordinator {
    /// Coordinator whose live stores are created under `out_prefix`
    pub fn new(out_prefix: impl Into<PathBuf>, params: RunParameters) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            out_prefix: out_prefix.into(),
            params,
            state: Mutex::new(CoordinatorState {
                run_state: RunState::Uninitialized,
                samples: None,
                counters: RunCounters::default(),
                chromosome_order: Vec::new(),
                chromosome_numbers: HashMap::new(),
            }),
            chromosomes: RwLock::new(HashMap::new()),
            summary: RwLock::new(None),
            telemetry: None,
        })
    }

    /// Report progress to `telemetry` as observations arrive
    pub fn with_telemetry(mut self, telemetry: Arc<TelemetryBlackboard>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn out_prefix(&self) -> &Path {
        &self.out_prefix
    }

    pub fn params(&self) -> &RunParameters {
        &self.params
    }

    pub fn run_state(&self) -> RunState {
        self.state.lock().run_state
    }

    pub fn counters(&self) -> RunCounters {
        self.state.lock().counters
    }

    pub fn samples(&self) -> Option<Samples> {
        self.state.lock().samples.clone()
    }

    /// Chromosome names in first-seen order
    pub fn chromosome_order(&self) -> Vec<String> {
        self.state.lock().chromosome_order.clone()
    }

    pub fn chromosome(&self, name: &str) -> Result<Arc<Mutex<Chromosome>>> {
        self.chromosomes
            .read()
            .get(name)
            .map(Arc::clone)
            .ok_or_else(|| IbError::not_found("chromosome", name))
    }

    /// Run `f` against the genome summary block
    pub fn with_summary<T>(&self, f: impl FnOnce(&Block) -> T) -> Result<T> {
        let guard = self.summary.read();
        let manager = guard
            .as_ref()
            .ok_or_else(|| IbError::not_found("summary", self.out_prefix.display()))?;
        Ok(f(manager.get_by_position(0)?))
    }

    // ========================================================================
    // Ingest
    // ========================================================================

    fn initialize(&self, state: &mut CoordinatorState, sample_names: &[String]) -> Result<()> {
        let num_samples = sample_names.len() as u64;
        let mut manager = BlockManager::new(
            SUMMARY_DOMAIN,
            summary_store_path(&self.out_prefix),
            self.params.width,
            num_samples,
            self.params.block_size,
        )?;
        manager.new_block(Some(SUMMARY_DOMAIN), 0)?;
        *self.summary.write() = Some(manager);

        state.samples = Some(Samples::from_ids(sample_names));
        state.counters.num_samples = num_samples;
        state.counters.num_registers = 1;
        state.run_state = RunState::Active;
        if let Some(telemetry) = &self.telemetry {
            telemetry.set_stage(Stage::Ingesting);
        }
        info!(
            samples = num_samples,
            width = %self.params.width,
            block_size = self.params.block_size,
            "ingest run active"
        );
        Ok(())
    }

    /// Chromosome for `observation`, created on first sight. Runs under the
    /// state lock so creation is serialized.
    fn chromosome_entry(
        &self,
        state: &mut CoordinatorState,
        observation: &Observation,
    ) -> Result<Arc<Mutex<Chromosome>>> {
        let name = &observation.chromosome_name;
        if let Some(&number) = state.chromosome_numbers.get(name) {
            if number != observation.chromosome_number {
                return Err(IbError::invalid_data(format!(
                    "chromosome {} seen as number {} at position {}, earlier as number {}",
                    name, observation.chromosome_number, observation.position, number
                )));
            }
            return self.chromosome(name);
        }

        let chromosome = Chromosome::new(
            name.clone(),
            observation.chromosome_number,
            chromosome_store_path(&self.out_prefix, name),
            self.params.width,
            state.counters.num_samples,
            self.params.block_size,
            self.params.keep_empty_blocks,
        )?;
        let entry = Arc::new(Mutex::new(chromosome));
        self.chromosomes.write().insert(name.clone(), Arc::clone(&entry));
        state.chromosome_order.push(name.clone());
        state
            .chromosome_numbers
            .insert(name.clone(), observation.chromosome_number);
        debug!(chromosome = %name, number = observation.chromosome_number, "new chromosome");
        Ok(entry)
    }

    /// Accumulate one observation into its chromosome block, the chromosome
    /// summary and the genome summary
    pub fn ingest(&self, sample_names: &[String], observation: &Observation) -> Result<()> {
        let chromosome = {
            let mut state = self.state.lock();
            match state.run_state {
                RunState::Finalizing | RunState::Closed => {
                    return Err(IbError::Closed(format!(
                        "ingest run {}",
                        self.out_prefix.display()
                    )));
                }
                RunState::Uninitialized => self.initialize(&mut state, sample_names)?,
                RunState::Active => {}
            }

            let expected = state.counters.num_samples as usize;
            let actual = if sample_names.len() != expected {
                sample_names.len()
            } else {
                observation.distances.dimension() as usize
            };
            if actual != expected {
                return Err(IbError::SampleCountMismatch {
                    chromosome: observation.chromosome_name.clone(),
                    position: observation.position,
                    expected,
                    actual,
                });
            }
            let entry = self.chromosome_entry(&mut state, observation)?;
            state.counters.num_snps += 1;
            entry
        };

        let created = {
            let mut chromosome = chromosome.lock();
            let before = chromosome.num_blocks();
            let number = chromosome.block_number_of(observation.position);
            chromosome.add(number, observation.position, &observation.distances)?;
            (chromosome.num_blocks() - before) as u64
        };

        {
            let guard = self.summary.read();
            let manager = guard
                .as_ref()
                .ok_or_else(|| IbError::invalid_data("summary store missing on an active run"))?;
            manager
                .get_by_position(0)?
                .accumulate_atomic(observation.position, &observation.distances)
                .map_err(|e| e.in_matrix(&observation.chromosome_name, "genome summary"))?;
        }

        if created > 0 {
            let mut state = self.state.lock();
            state.counters.num_blocks += created;
            state.counters.num_registers += created;
        }
        if let Some(telemetry) = &self.telemetry {
            telemetry.record_observation();
            telemetry.record_blocks(created);
        }
        Ok(())
    }

    // ========================================================================
    // Finalize, save, close
    // ========================================================================

    /// Sync every store and cross-check the totals. Ingest is refused
    /// afterwards.
    #[instrument(skip_all, fields(prefix = %self.out_prefix.display()))]
    pub fn finalize(&self) -> Result<()> {
        let mut state = self.state.lock();
        match state.run_state {
            RunState::Closed => {
                return Err(IbError::Closed(format!(
                    "ingest run {}",
                    self.out_prefix.display()
                )))
            }
            RunState::Finalizing => return Ok(()),
            RunState::Uninitialized | RunState::Active => {}
        }
        if let Some(telemetry) = &self.telemetry {
            telemetry.set_stage(Stage::Finalizing);
        }

        let mut chromosome_snps = 0;
        for name in &state.chromosome_order {
            let chromosome = self.chromosome(name)?;
            let mut chromosome = chromosome.lock();
            chromosome.sync()?;
            chromosome.check()?;
            chromosome_snps += chromosome.num_snps();
        }

        if let Some(manager) = self.summary.write().as_mut() {
            manager.sync()?;
            let summary = manager.get_by_position(0)?;
            summary.check()?;
            if summary.num_snps() != state.counters.num_snps {
                return Err(IbError::invalid_data(format!(
                    "summary holds {} SNPs but {} were ingested",
                    summary.num_snps(),
                    state.counters.num_snps
                )));
            }
        }
        if chromosome_snps != state.counters.num_snps {
            return Err(IbError::invalid_data(format!(
                "chromosomes hold {} SNPs but {} were ingested",
                chromosome_snps, state.counters.num_snps
            )));
        }

        state.run_state = RunState::Finalizing;
        info!(
            snps = state.counters.num_snps,
            blocks = state.counters.num_blocks,
            chromosomes = state.chromosome_order.len(),
            "ingest run finalized"
        );
        Ok(())
    }

    /// Finalize, then write `<prefix>_matrix.bin[.gz]` and
    /// `<prefix>_matrix.json`. Returns the ledger path.
    #[instrument(skip_all, fields(prefix = %prefix.as_ref().display()))]
    pub fn save(&self, prefix: impl AsRef<Path>) -> Result<PathBuf> {
        let prefix = prefix.as_ref();
        self.finalize()?;
        if let Some(telemetry) = &self.telemetry {
            telemetry.set_stage(Stage::Saving);
        }

        let state = self.state.lock();
        let samples = state
            .samples
            .clone()
            .ok_or_else(|| IbError::invalid_data("cannot save a run that saw no observations"))?;

        let path = ledger_path(prefix, self.params.compression);
        let mut writer = LedgerWriter::open_for_write(&path, self.params.compression)?;

        let summary = {
            let mut guard = self.summary.write();
            let manager = guard
                .as_mut()
                .ok_or_else(|| IbError::invalid_data("summary store missing on an active run"))?;
            let block = manager.get_by_position_mut(0)?;
            let serial = writer.write(&block.matrix().snapshot())?;
            block.set_serial(serial);
            block.info()
        };

        let mut chromosomes = Vec::with_capacity(state.chromosome_order.len());
        for name in &state.chromosome_order {
            let chromosome = self.chromosome(name)?;
            let mut chromosome = chromosome.lock();
            chromosome.dump(&mut writer)?;
            chromosomes.push(ChromosomeLayout {
                info: chromosome.info(),
                summary: chromosome.summary().info(),
                blocks: chromosome.block_infos(),
            });
        }
        writer.close()?;

        let ledger = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| IbError::config(format!("bad output prefix {}", prefix.display())))?;
        let metadata = DatabaseMetadata {
            samples,
            parameters: self.params.clone(),
            num_samples: state.counters.num_samples,
            num_snps: state.counters.num_snps,
            num_blocks: state.counters.num_blocks,
            num_registers: state.counters.num_registers,
            ledger,
            summary,
            chromosomes,
        };
        metadata.write(&metadata_path(prefix))?;

        info!(ledger = %path.display(), "saved database");
        Ok(path)
    }

    /// Sync and release every store
    pub fn close(&self) -> Result<()> {
        self.finalize()?;
        let mut state = self.state.lock();
        for name in &state.chromosome_order {
            self.chromosome(name)?.lock().close()?;
        }
        if let Some(manager) = self.summary.write().as_mut() {
            manager.close()?;
        }
        state.run_state = RunState::Closed;
        if let Some(telemetry) = &self.telemetry {
            telemetry.set_stage(Stage::Complete);
        }
        info!(prefix = %self.out_prefix.display(), "ingest run closed");
        Ok(())
    }
}

// ============================================================================
// Partitioned ingest
// ============================================================================

/// Split chromosomes into at most `threads` contiguous groups of roughly
/// equal register count. Each chromosome lands in the group its register
/// midpoint falls into.
pub fn spread_chromosomes(chromosomes: &[(String, u64)], threads: usize) -> Vec<Vec<String>> {
    let groups = resolve_threads(threads).min(chromosomes.len()).max(1);
    let total: u64 = chromosomes.iter().map(|(_, registers)| registers).sum();
    let mut result = vec![Vec::new(); groups];
    let mut before = 0u64;
    for (i, (name, registers)) in chromosomes.iter().enumerate() {
        let group = if total == 0 {
            i * groups / chromosomes.len()
        } else {
            let midpoint = before as u128 * 2 + *registers as u128;
            (midpoint * groups as u128 / (total as u128 * 2)) as usize
        };
        result[group.min(groups - 1)].push(name.clone());
        before += registers;
    }
    result.retain(|group| !group.is_empty());
    result
}

/// Observations of one chromosome, with its expected register count
pub struct ChromosomeFeed<I> {
    pub name: String,
    pub num_registers: u64,
    pub observations: I,
}

/// Ingest every feed, one group of chromosomes per worker.
///
/// `threads` falls back to the run's configured thread count.
pub fn ingest_partitioned<I>(
    coordinator: &IngestCoordinator,
    sample_names: &[String],
    feeds: Vec<ChromosomeFeed<I>>,
    threads: Option<usize>,
) -> Result<()>
where
    I: IntoIterator<Item = Result<Observation>>,
    I::IntoIter: Send,
{
    let threads = threads.unwrap_or(coordinator.params().threads);
    let loads: Vec<(String, u64)> = feeds
        .iter()
        .map(|feed| (feed.name.clone(), feed.num_registers))
        .collect();

    // Known only when every feed reports an exact upper bound
    let mut expected = Some(0u64);
    let mut by_name: HashMap<String, I::IntoIter> = HashMap::with_capacity(feeds.len());
    for feed in feeds {
        if by_name.contains_key(&feed.name) {
            return Err(IbError::invalid_data(format!(
                "chromosome {} is fed twice",
                feed.name
            )));
        }
        let observations = feed.observations.into_iter();
        expected = expected
            .zip(observations.size_hint().1)
            .map(|(total, upper)| total + upper as u64);
        by_name.insert(feed.name, observations);
    }

    let work: Vec<Vec<(String, I::IntoIter)>> = spread_chromosomes(&loads, threads)
        .into_iter()
        .map(|group| {
            group
                .into_iter()
                .filter_map(|name| by_name.remove(&name).map(|feed| (name, feed)))
                .collect()
        })
        .collect();
    if let Some(telemetry) = &coordinator.telemetry {
        telemetry.set_total_chromosomes(loads.len() as u64);
        if let Some(total) = expected {
            telemetry.set_total_observations(total);
        }
    }

    let pool = build_thread_pool(work.len())?;
    info!(workers = work.len(), chromosomes = loads.len(), "partitioned ingest");
    pool.install(|| {
        work.into_par_iter().try_for_each(|group| -> Result<()> {
            for (name, observations) in group {
                let _span = info_span!("ingest_chromosome", chromosome = %name).entered();
                for observation in observations {
                    coordinator.ingest(sample_names, &observation?)?;
                }
                if let Some(telemetry) = &coordinator.telemetry {
                    telemetry.record_chromosome_done();
                }
            }
            Ok(())
        })
    })
}

// ============================================================================
// Queries against the live run
// ============================================================================

impl IngestCoordinator {
    fn with_chromosome<T>(
        &self,
        name: &str,
        f: impl FnOnce(&Chromosome) -> Result<T>,
    ) -> Result<T> {
        let chromosome = self.chromosome(name)?;
        let chromosome = chromosome.lock();
        f(&chromosome)
    }

    fn summary_ready(&self) -> bool {
        self.summary.read().is_some()
    }
}

impl DistanceQueries for IngestCoordinator {
    fn sample_names(&self) -> Result<Option<Vec<String>>> {
        Ok(self.state.lock().samples.as_ref().map(Samples::to_strings))
    }

    fn chromosome_names(&self) -> Result<Option<Vec<String>>> {
        let state = self.state.lock();
        if state.run_state == RunState::Uninitialized {
            return Ok(None);
        }
        Ok(Some(state.chromosome_order.clone()))
    }

    fn summary_block(&self) -> Result<Option<BlockInfo>> {
        if !self.summary_ready() {
            return Ok(None);
        }
        self.with_summary(Block::info).map(Some)
    }

    fn summary_table(&self) -> Result<Option<Vec<u64>>> {
        if !self.summary_ready() {
            return Ok(None);
        }
        self.with_summary(|b| b.matrix().export_table()).map(Some)
    }

    fn summary_column(&self, reference: u64) -> Result<Option<Vec<u64>>> {
        if !self.summary_ready() {
            return Ok(None);
        }
        self.with_summary(|b| column_of(b.matrix(), reference))?
    }

    fn chromosome_summary(&self, chromosome: &str) -> Result<Option<BlockInfo>> {
        found(self.with_chromosome(chromosome, |c| Ok(c.summary().info())))
    }

    fn chromosome_table(&self, chromosome: &str) -> Result<Option<Vec<u64>>> {
        found(self.with_chromosome(chromosome, |c| Ok(c.summary().matrix().export_table())))
    }

    fn block(&self, chromosome: &str, number: u64) -> Result<Option<BlockInfo>> {
        found(self.with_chromosome(chromosome, |c| c.get_block(number).map(Block::info)))
    }

    fn block_table(&self, chromosome: &str, number: u64) -> Result<Option<Vec<u64>>> {
        found(self.with_chromosome(chromosome, |c| {
            c.get_block(number).map(|b| b.matrix().export_table())
        }))
    }

    fn block_column(
        &self,
        chromosome: &str,
        number: u64,
        reference: u64,
    ) -> Result<Option<Vec<u64>>> {
        let column = found(self.with_chromosome(chromosome, |c| {
            column_of(c.get_block(number)?.matrix(), reference)
        }))?;
        Ok(column.flatten())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("s{}", i)).collect()
    }

    fn params(block_size: u64) -> RunParameters {
        RunParameters {
            block_size,
            ..Default::default()
        }
    }

    fn observation(
        chrom: &str,
        number: u64,
        position: u64,
        pairs: &[(u64, u64, u64)],
    ) -> Observation {
        let pairs = pairs.iter().copied();
        Observation::from_pairs(chrom, number, position, 4, CounterWidth::W32, pairs).unwrap()
    }

    #[test]
    fn test_two_snp_scenario() {
        let dir = tempdir().unwrap();
        let run = IngestCoordinator::new(dir.path().join("run"), params(100)).unwrap();
        let samples = names(4);
        let pairs = [(0, 1, 1), (2, 3, 2)];
        run.ingest(&samples, &observation("chr1", 1, 10, &pairs)).unwrap();
        run.ingest(&samples, &observation("chr1", 1, 20, &pairs)).unwrap();

        let block = run.block("chr1", 0).unwrap().unwrap();
        assert_eq!(block.min_position, 10);
        assert_eq!(block.max_position, 20);
        assert_eq!(block.num_snps, 2);
        assert_eq!(run.block_table("chr1", 0).unwrap().unwrap(), vec![2, 0, 0, 0, 0, 4]);
        assert_eq!(run.summary_table().unwrap().unwrap(), vec![2, 0, 0, 0, 0, 4]);
        assert_eq!(run.run_state(), RunState::Active);
        assert_eq!(
            run.counters(),
            RunCounters {
                num_samples: 4,
                num_snps: 2,
                num_blocks: 1,
                num_registers: 2,
            }
        );
    }

    #[test]
    fn test_sample_count_mismatch() {
        let dir = tempdir().unwrap();
        let run = IngestCoordinator::new(dir.path().join("run"), params(100)).unwrap();
        run.ingest(&names(4), &observation("chr1", 1, 10, &[(0, 1, 1)])).unwrap();
        let err = run
            .ingest(&names(3), &observation("chr1", 1, 20, &[(0, 1, 1)]))
            .unwrap_err();
        assert!(matches!(
            err,
            IbError::SampleCountMismatch { expected: 4, actual: 3, .. }
        ));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_ingest_after_finalize_is_refused() {
        let dir = tempdir().unwrap();
        let run = IngestCoordinator::new(dir.path().join("run"), params(100)).unwrap();
        run.ingest(&names(4), &observation("chr1", 1, 10, &[(0, 1, 1)])).unwrap();
        run.finalize().unwrap();
        assert_eq!(run.run_state(), RunState::Finalizing);
        assert!(matches!(
            run.ingest(&names(4), &observation("chr1", 1, 20, &[])),
            Err(IbError::Closed(_))
        ));
        run.close().unwrap();
        assert_eq!(run.run_state(), RunState::Closed);
        assert!(matches!(run.finalize(), Err(IbError::Closed(_))));
    }

    #[test]
    fn test_queries_before_first_observation() {
        let dir = tempdir().unwrap();
        let run = IngestCoordinator::new(dir.path().join("run"), params(100)).unwrap();
        assert_eq!(run.sample_names().unwrap(), None);
        assert_eq!(run.chromosome_names().unwrap(), None);
        assert_eq!(run.summary_block().unwrap(), None);
        assert_eq!(run.summary_column(0).unwrap(), None);
        assert_eq!(run.block("chr1", 0).unwrap(), None);
    }

    #[test]
    fn test_missing_items_are_none() {
        let dir = tempdir().unwrap();
        let run = IngestCoordinator::new(dir.path().join("run"), params(100)).unwrap();
        run.ingest(&names(4), &observation("chr1", 1, 10, &[(0, 3, 5)])).unwrap();
        assert_eq!(run.chromosome_summary("chrX").unwrap(), None);
        assert_eq!(run.block("chr1", 9).unwrap(), None);
        assert_eq!(run.block_column("chr1", 0, 4).unwrap(), None);
        assert_eq!(run.block_column("chr1", 0, 3).unwrap(), Some(vec![5, 0, 0, 0]));
        assert_eq!(run.summary_column(3).unwrap(), Some(vec![5, 0, 0, 0]));
    }

    #[test]
    fn test_blocks_counted_with_backfill() {
        let dir = tempdir().unwrap();
        let run = IngestCoordinator::new(dir.path().join("run"), params(100)).unwrap();
        run.ingest(&names(4), &observation("chr1", 1, 350, &[(0, 1, 1)])).unwrap();
        run.ingest(&names(4), &observation("chr2", 2, 50, &[(0, 1, 1)])).unwrap();
        let counters = run.counters();
        assert_eq!(counters.num_blocks, 5);
        assert_eq!(counters.num_registers, 6);
        assert_eq!(run.chromosome_order(), vec!["chr1".to_string(), "chr2".to_string()]);
    }

    #[test]
    fn test_chromosome_number_is_fixed() {
        let dir = tempdir().unwrap();
        let run = IngestCoordinator::new(dir.path().join("run"), params(100)).unwrap();
        run.ingest(&names(4), &observation("chr3", 3, 10, &[(0, 1, 1)])).unwrap();
        assert!(matches!(
            run.ingest(&names(4), &observation("chr3", 4, 20, &[(0, 1, 1)])),
            Err(IbError::InvalidData { .. })
        ));
        run.ingest(&names(4), &observation("chr3", 3, 30, &[(0, 1, 1)])).unwrap();
        assert_eq!(run.chromosome("chr3").unwrap().lock().number(), 3);
    }

    #[test]
    fn test_overflow_names_chromosome_and_block() {
        let dir = tempdir().unwrap();
        let run = IngestCoordinator::new(
            dir.path().join("run"),
            RunParameters {
                block_size: 100,
                width: CounterWidth::W16,
                ..Default::default()
            },
        )
        .unwrap();
        let heavy = |chrom: &str, number: u64, position: u64, value: u64| {
            Observation::from_pairs(chrom, number, position, 4, CounterWidth::W16, [(0, 1, value)])
                .unwrap()
        };

        run.ingest(&names(4), &heavy("chr7", 7, 1230, 60000)).unwrap();
        let err = run.ingest(&names(4), &heavy("chr7", 7, 1234, 60000)).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(
            err.to_string(),
            "counter overflow in chr7 block #12 at pair (0, 1) at position 1234: \
             60000 + 60000 does not fit in 16 bits"
        );

        let dir = tempdir().unwrap();
        let run = IngestCoordinator::new(
            dir.path().join("run"),
            RunParameters {
                block_size: 100,
                width: CounterWidth::W16,
                ..Default::default()
            },
        )
        .unwrap();
        run.ingest(&names(4), &heavy("chr1", 1, 50, 40000)).unwrap();
        let err = run.ingest(&names(4), &heavy("chr2", 2, 75, 40000)).unwrap_err();
        assert!(matches!(
            &err,
            IbError::PairOverflow { chromosome, block, position: Some(75), .. }
                if chromosome == "chr2" && block == "genome summary"
        ));
    }

    #[test]
    fn test_partitioned_ingest_reports_progress() {
        use crate::utils::telemetry::Stage;

        let dir = tempdir().unwrap();
        let telemetry = TelemetryBlackboard::new();
        let run = IngestCoordinator::new(
            dir.path().join("run"),
            RunParameters {
                block_size: 100,
                threads: 2,
                ..Default::default()
            },
        )
        .unwrap()
        .with_telemetry(Arc::clone(&telemetry));
        let feeds = ["chr1", "chr2", "chr3"]
            .iter()
            .enumerate()
            .map(|(c, name)| ChromosomeFeed {
                name: name.to_string(),
                num_registers: 4,
                observations: (0..5u64)
                    .map(|k| Ok(observation(name, c as u64 + 1, k * 70, &[(0, 2, 1)])))
                    .collect::<Vec<_>>(),
            })
            .collect();

        ingest_partitioned(&run, &names(4), feeds, None).unwrap();
        assert_eq!(telemetry.stage(), Stage::Ingesting);
        assert_eq!(telemetry.observations(), 15);
        assert_eq!(telemetry.total_observations(), 15);
        assert_eq!(telemetry.chromosomes_done(), 3);
        assert_eq!(telemetry.total_chromosomes(), 3);
        assert_eq!(telemetry.blocks_created(), run.counters().num_blocks);
        assert_eq!(run.counters().num_blocks, 9);

        run.close().unwrap();
        assert_eq!(telemetry.stage(), Stage::Complete);
    }

    #[test]
    fn test_spread_chromosomes_balances_registers() {
        let even: Vec<(String, u64)> =
            (1..=4).map(|i| (format!("chr{}", i), 10)).collect();
        assert_eq!(
            spread_chromosomes(&even, 2),
            vec![
                vec!["chr1".to_string(), "chr2".to_string()],
                vec!["chr3".to_string(), "chr4".to_string()],
            ]
        );
        assert_eq!(spread_chromosomes(&even, 1).len(), 1);

        let skewed = vec![("a".to_string(), 1), ("b".to_string(), 100)];
        assert_eq!(
            spread_chromosomes(&skewed, 4),
            vec![vec!["a".to_string()], vec!["b".to_string()]]
        );
        assert!(spread_chromosomes(&[], 4).is_empty());
    }

    #[test]
    fn test_ingest_partitioned_matches_sequential() {
        let dir = tempdir().unwrap();
        let samples = names(4);
        let feed = |name: &str, number: u64| ChromosomeFeed {
            name: name.to_string(),
            num_registers: 3,
            observations: (0..20u64)
                .map(|k| Ok(observation(name, number, k * 10, &[(0, 1, 1), (1, 3, k)])))
                .collect::<Vec<_>>(),
        };

        let run = IngestCoordinator::new(dir.path().join("par"), params(100)).unwrap();
        let feeds = vec![feed("chr1", 1), feed("chr2", 2)];
        ingest_partitioned(&run, &samples, feeds, Some(2)).unwrap();
        run.finalize().unwrap();

        assert_eq!(run.counters().num_snps, 40);
        let summary = run.summary_table().unwrap().unwrap();
        assert_eq!(summary[0], 40);
        assert_eq!(summary[4], 2 * (0..20u64).sum::<u64>());
        assert_eq!(run.chromosome_table("chr2").unwrap().unwrap()[0], 20);
    }
}
