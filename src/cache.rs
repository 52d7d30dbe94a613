//! Sharded tensorization cache
//!
//! Training data is tensorized once, by a single materializing process, and
//! persisted as one safetensors file per training consumer. Each consumer
//! later loads only its own shard.
//!
//! ## Pipeline
//!
//! 1. Partition by task (demonstrations never cross tasks) or, without
//!    demonstrations, into `n_process` contiguous chunks.
//! 2. Tensorize partitions in parallel; a partition with an example that
//!    cannot fit its budget is skipped and logged.
//! 3. Concatenate in partition order, permute with the configured seed, and
//!    split into `n_gpu` shards of `ceil(rows / n_gpu)` rows.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use safetensors::tensor::{Dtype, SafeTensors, TensorView};
use tracing::{debug, info, warn};

use crate::config::DataConfig;
use crate::corpus::TrainingExample;
use crate::error::{MetaIclError, Result};
use crate::masks::PackedRow;
use crate::tensorize::{TensorTable, Tensorizer};
use crate::tokenizer::TokenEncoder;

const TENSOR_NAMES: [&str; 3] = ["input_ids", "attention_mask", "segment_mask"];

/// Parameters that determine shard contents; encoded in every file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    pub keyword: String,
    pub method: String,
    pub k: String,
    pub seed: u64,
    pub length: String,
}

impl CacheKey {
    pub fn new(config: &DataConfig, keyword: &str, n_examples: usize) -> Self {
        let (k, length) = if config.use_demonstrations {
            (
                format!("{n_examples}-{}", config.k),
                format!("{}-{}", config.max_length, config.max_length_per_example),
            )
        } else {
            (n_examples.to_string(), config.max_length.to_string())
        };
        Self {
            keyword: keyword.to_string(),
            method: config.method_name(),
            k,
            seed: config.seed,
            length,
        }
    }

    pub fn file_name(&self, rank: usize) -> String {
        format!(
            "{}_{}_k={}_seed={}_length={}-rank={rank}.safetensors",
            self.keyword, self.method, self.k, self.seed, self.length
        )
    }
}

/// Which shards to load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardSelection {
    /// The shard of one consumer
    Rank(usize),
    /// Every shard, concatenated in rank order
    All,
}

impl ShardSelection {
    pub fn from_local_rank(local_rank: Option<usize>) -> Self {
        local_rank.map_or(ShardSelection::All, ShardSelection::Rank)
    }
}

/// Result of a materialize call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Materialized {
    /// Every shard file already existed; nothing was recomputed
    AlreadyPresent,
    Written {
        rows: usize,
        /// Partitions dropped because an example exceeded its budget
        skipped_partitions: Vec<String>,
    },
}

/// One unit of work for the fan-out
#[derive(Debug, Clone)]
pub struct Partition {
    pub name: String,
    pub examples: Vec<TrainingExample>,
}

/// Fan-out/fan-in of the tensorizer with persisted, per-consumer shards
pub struct ShardedTensorizationCache<'a> {
    tensorizer: Tensorizer<'a>,
}

impl<'a> ShardedTensorizationCache<'a> {
    pub fn new(tokenizer: &'a dyn TokenEncoder, config: DataConfig) -> Self {
        Self {
            tensorizer: Tensorizer::new(tokenizer, config),
        }
    }

    pub fn config(&self) -> &DataConfig {
        self.tensorizer.config()
    }

    /// Paths of all `n_gpu` shard files for this key
    pub fn shard_paths(&self, key: &CacheKey) -> Vec<PathBuf> {
        (0..self.config().n_gpu.max(1))
            .map(|rank| self.config().tensorize_dir.join(key.file_name(rank)))
            .collect()
    }

    /// Split training data into independent partitions.
    ///
    /// Very large multi-task corpora (see [`DataConfig::should_subsample`])
    /// are subsampled per task: 10% with demonstrations, 50% without.
    pub fn partition(&self, data: &[TrainingExample], rng: &mut StdRng) -> Vec<Partition> {
        let config = self.config();
        let mut by_task: BTreeMap<&str, Vec<TrainingExample>> = BTreeMap::new();
        for example in data {
            by_task
                .entry(example.task.as_str())
                .or_default()
                .push(example.clone());
        }

        let huge = config.should_subsample(by_task.len(), data.len());
        if !config.use_demonstrations && !huge {
            let n_per_shard = data.len().div_ceil(config.n_process.max(1)).max(1);
            return data
                .chunks(n_per_shard)
                .enumerate()
                .map(|(i, chunk)| Partition {
                    name: format!("chunk-{i}"),
                    examples: chunk.to_vec(),
                })
                .collect();
        }

        by_task
            .into_iter()
            .map(|(task, mut examples)| {
                if huge {
                    let keep = if config.use_demonstrations {
                        examples.len() / 10
                    } else {
                        examples.len() / 2
                    };
                    info!(
                        "Sampling training data of {} from {} to {}",
                        task,
                        examples.len(),
                        keep
                    );
                    examples.shuffle(rng);
                    examples.truncate(keep);
                }
                Partition {
                    name: task.to_string(),
                    examples,
                }
            })
            .collect()
    }

    /// Tensorize partitions in parallel and merge them in partition order.
    ///
    /// Returns the merged table and the names of skipped partitions.
    pub fn tensorize_partitions(&self, partitions: &[Partition]) -> Result<(TensorTable, Vec<String>)> {
        let config = self.config();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.n_process.max(1))
            .build()
            .map_err(|e| MetaIclError::WorkerPool(e.to_string()))?;

        info!(
            "Tensorizing {} partitions on {} worker(s)",
            partitions.len(),
            config.n_process.max(1)
        );

        let seed = config.seed;
        let outputs: Vec<Result<Option<TensorTable>>> = pool.install(|| {
            partitions
                .par_iter()
                .enumerate()
                .map(|(i, partition)| {
                    let mut rng = StdRng::seed_from_u64(partition_seed(seed, i));
                    match self
                        .tensorizer
                        .tensorize_for_training(&partition.examples, &mut rng)
                    {
                        Ok(table) => Ok(Some(table)),
                        Err(e) if e.is_budget() => {
                            warn!("Skipping partition {}: {}", partition.name, e);
                            Ok(None)
                        }
                        Err(e) => Err(MetaIclError::Partition {
                            name: partition.name.clone(),
                            source: Box::new(e),
                        }),
                    }
                })
                .collect()
        });

        let mut merged = TensorTable::new(config.max_length);
        let mut skipped = Vec::new();
        for (partition, output) in partitions.iter().zip(outputs) {
            match output? {
                Some(table) => merged.append(table),
                None => skipped.push(partition.name.clone()),
            }
        }
        Ok((merged, skipped))
    }

    /// Tensorize `data` and persist one shard per consumer.
    ///
    /// A no-op when every shard file for this configuration already exists.
    pub fn materialize(&self, data: &[TrainingExample], keyword: &str) -> Result<Materialized> {
        let config = self.config();
        let key = CacheKey::new(config, keyword, data.len());
        let paths = self.shard_paths(&key);

        let existing = paths.iter().filter(|p| p.exists()).count();
        if existing == paths.len() {
            info!("Tensorized shards already exist for {}", keyword);
            return Ok(Materialized::AlreadyPresent);
        }
        if existing > 0 {
            warn!(
                "Only {}/{} shards exist for {}; regenerating all of them",
                existing,
                paths.len(),
                keyword
            );
        }

        std::fs::create_dir_all(&config.tensorize_dir)?;

        let mut rng = StdRng::seed_from_u64(config.seed);
        info!("Sharding inputs...");
        let partitions = self.partition(data, &mut rng);
        let (mut table, skipped_partitions) = self.tensorize_partitions(&partitions)?;

        table.shuffle(&mut rng);
        let rows = table.len();
        for (rank, (shard, path)) in table.into_shards(paths.len()).into_iter().zip(&paths).enumerate() {
            write_shard(path, &shard, rank, paths.len())?;
            info!("Preprocessing done for rank {} ({} rows)", rank, shard.len());
        }
        info!("Finished saving {} tensorized rows", rows);

        Ok(Materialized::Written {
            rows,
            skipped_partitions,
        })
    }

    /// Load persisted shards without recomputing anything
    pub fn load(&self, keyword: &str, n_examples: usize, selection: ShardSelection) -> Result<TensorTable> {
        let key = CacheKey::new(self.config(), keyword, n_examples);
        let paths = self.shard_paths(&key);
        let selected: Vec<&PathBuf> = match selection {
            ShardSelection::All => paths.iter().collect(),
            ShardSelection::Rank(rank) => {
                let path = paths.get(rank).ok_or_else(|| {
                    MetaIclError::validation(format!(
                        "Rank {rank} out of range ({} shards)",
                        paths.len()
                    ))
                })?;
                vec![path]
            }
        };

        if let Some(missing) = selected.iter().find(|p| !p.exists()) {
            return Err(MetaIclError::MissingShard(missing.display().to_string()));
        }

        let mut table = TensorTable::new(self.config().max_length);
        for path in selected {
            debug!("Loading shard {}", path.display());
            table.append(read_shard(path, self.config().max_length)?);
        }
        Ok(table)
    }

    /// Materialize when requested, then load the selected shards
    pub fn prepare(
        &self,
        data: &[TrainingExample],
        keyword: &str,
        do_tensorize: bool,
        selection: ShardSelection,
    ) -> Result<TensorTable> {
        if do_tensorize {
            self.materialize(data, keyword)?;
        }
        self.load(keyword, data.len(), selection)
    }
}

/// Independent, scheduling-free RNG stream per partition
fn partition_seed(seed: u64, index: usize) -> u64 {
    seed.wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .wrapping_add(index as u64 + 1)
}

fn to_le_bytes(rows: &[PackedRow], field: impl Fn(&PackedRow) -> &[u32]) -> Vec<u8> {
    rows.iter()
        .flat_map(|row| field(row).iter().flat_map(|v| v.to_le_bytes()))
        .collect()
}

/// Persist a shard: three `U32` tensors of shape `(rows, max_length)`.
///
/// Written to a temporary file first so readers never see a partial shard.
pub fn write_shard(path: &Path, table: &TensorTable, rank: usize, n_shards: usize) -> Result<()> {
    let shape = vec![table.len(), table.max_length()];
    let buffers = [
        to_le_bytes(table.rows(), |r| r.input_ids.as_slice()),
        to_le_bytes(table.rows(), |r| r.attention_mask.as_slice()),
        to_le_bytes(table.rows(), |r| r.segment_mask.as_slice()),
    ];
    let views = buffers
        .iter()
        .map(|bytes| TensorView::new(Dtype::U32, shape.clone(), bytes))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let metadata: HashMap<String, String> = [
        ("max_length", table.max_length().to_string()),
        ("rows", table.len().to_string()),
        ("shard", rank.to_string()),
        ("n_shards", n_shards.to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();

    let tmp = path.with_extension("safetensors.tmp");
    safetensors::serialize_to_file(
        TENSOR_NAMES.iter().copied().zip(views.iter()),
        &Some(metadata),
        &tmp,
    )?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Read a shard written by [`write_shard`]
pub fn read_shard(path: &Path, max_length: usize) -> Result<TensorTable> {
    let corrupt = |reason: String| MetaIclError::CorruptShard {
        path: path.display().to_string(),
        reason,
    };

    let data = std::fs::read(path)?;
    let st = SafeTensors::deserialize(&data)?;

    let mut columns = Vec::with_capacity(TENSOR_NAMES.len());
    let mut n_rows = None;
    for name in TENSOR_NAMES {
        let view = st.tensor(name)?;
        if view.dtype() != Dtype::U32 {
            return Err(corrupt(format!("{name} has dtype {:?}", view.dtype())));
        }
        match view.shape() {
            [rows, len] if *len == max_length => {
                if n_rows.is_some_and(|n| n != *rows) {
                    return Err(corrupt(format!("{name} has {rows} rows")));
                }
                n_rows = Some(*rows);
            }
            shape => {
                return Err(corrupt(format!(
                    "{name} has shape {shape:?}, expected (rows, {max_length})"
                )))
            }
        }
        let values: Vec<u32> = view
            .data()
            .chunks_exact(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        columns.push(values);
    }

    let n_rows = n_rows.unwrap_or(0);
    let row_slice = |column: &[u32], i: usize| column[i * max_length..(i + 1) * max_length].to_vec();
    let rows = (0..n_rows)
        .map(|i| PackedRow {
            input_ids: row_slice(&columns[0], i),
            attention_mask: row_slice(&columns[1], i),
            segment_mask: row_slice(&columns[2], i),
        })
        .collect();
    TensorTable::from_rows(max_length, rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::masks::pack;
    use crate::tokenizer::ByteTokenizer;

    fn config(dir: &Path, use_demonstrations: bool) -> DataConfig {
        DataConfig {
            k: 2,
            use_demonstrations,
            max_length: 64,
            max_length_per_example: 32,
            n_process: 2,
            n_gpu: 2,
            tensorize_dir: dir.to_path_buf(),
            seed: 13,
            ..Default::default()
        }
    }

    fn data() -> Vec<TrainingExample> {
        let mut data = Vec::new();
        for task in ["a", "b"] {
            for i in 0..5 {
                data.push(TrainingExample::new(task, format!("{task}{i}"), format!("o{i}")));
            }
        }
        data
    }

    #[test]
    fn test_cache_key_file_name() {
        let cfg = DataConfig {
            k: 16,
            max_length: 1024,
            max_length_per_example: 256,
            seed: 100,
            ..Default::default()
        };
        let key = CacheKey::new(&cfg, "hr_to_lr", 1000);
        assert_eq!(
            key.file_name(1),
            "hr_to_lr_direct-demon_k=1000-16_seed=100_length=1024-256-rank=1.safetensors"
        );

        let cfg = DataConfig {
            use_demonstrations: false,
            max_length: 256,
            ..cfg
        };
        let key = CacheKey::new(&cfg, "hr_to_lr", 1000);
        assert_eq!(
            key.file_name(0),
            "hr_to_lr_direct_k=1000_seed=100_length=256-rank=0.safetensors"
        );
    }

    #[test]
    fn test_partition_by_task_with_demonstrations() {
        let dir = tempfile::tempdir().unwrap();
        let tok = ByteTokenizer;
        let cache = ShardedTensorizationCache::new(&tok, config(dir.path(), true));
        let parts = cache.partition(&data(), &mut StdRng::seed_from_u64(0));
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].name, "a");
        assert!(parts[1].examples.iter().all(|e| e.task == "b"));
    }

    #[test]
    fn test_partition_chunks_without_demonstrations() {
        let dir = tempfile::tempdir().unwrap();
        let tok = ByteTokenizer;
        let mut cfg = config(dir.path(), false);
        cfg.n_process = 3;
        let cache = ShardedTensorizationCache::new(&tok, cfg);
        let parts = cache.partition(&data(), &mut StdRng::seed_from_u64(0));
        let sizes: Vec<usize> = parts.iter().map(|p| p.examples.len()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    fn wide_data(n_tasks: usize, per_task: usize) -> Vec<TrainingExample> {
        (0..n_tasks)
            .flat_map(|t| {
                (0..per_task).map(move |i| TrainingExample::new(format!("task{t:02}"), format!("q{i}"), format!("a{i}")))
            })
            .collect()
    }

    fn subsampling_config(dir: &Path, use_demonstrations: bool) -> DataConfig {
        DataConfig {
            subsample_min_tasks: 3,
            subsample_min_examples: 80,
            ..config(dir, use_demonstrations)
        }
    }

    #[test]
    fn test_partition_subsamples_large_corpus() {
        let dir = tempfile::tempdir().unwrap();
        let tok = ByteTokenizer;
        let data = wide_data(4, 20);

        let cache = ShardedTensorizationCache::new(&tok, subsampling_config(dir.path(), true));
        let parts = cache.partition(&data, &mut StdRng::seed_from_u64(5));
        assert_eq!(parts.len(), 4);
        for part in &parts {
            assert_eq!(part.examples.len(), 2);
            assert!(part.examples.iter().all(|e| e.task == part.name));
        }

        // without demonstrations a large corpus is still split by task, keeping half
        let cache = ShardedTensorizationCache::new(&tok, subsampling_config(dir.path(), false));
        let parts = cache.partition(&data, &mut StdRng::seed_from_u64(5));
        assert_eq!(parts.len(), 4);
        for part in &parts {
            assert_eq!(part.examples.len(), 10);
            assert!(part.examples.iter().all(|e| e.task == part.name));
        }
    }

    #[test]
    fn test_subsample_is_seeded() {
        let dir = tempfile::tempdir().unwrap();
        let tok = ByteTokenizer;
        let data = wide_data(4, 20);
        let cache = ShardedTensorizationCache::new(&tok, subsampling_config(dir.path(), false));

        let first = cache.partition(&data, &mut StdRng::seed_from_u64(9));
        let second = cache.partition(&data, &mut StdRng::seed_from_u64(9));
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.examples, b.examples);
        }
    }

    #[test]
    fn test_small_corpus_is_not_subsampled() {
        let dir = tempfile::tempdir().unwrap();
        let tok = ByteTokenizer;
        let data = wide_data(3, 20);
        let cache = ShardedTensorizationCache::new(&tok, subsampling_config(dir.path(), true));
        let parts = cache.partition(&data, &mut StdRng::seed_from_u64(5));
        assert!(parts.iter().all(|p| p.examples.len() == 20));
    }

    #[test]
    fn test_shard_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard.safetensors");
        let rows = vec![pack(&[1, 2], &[3], 5, false).unwrap(), pack(&[4], &[5, 6], 5, false).unwrap()];
        let table = TensorTable::from_rows(5, rows).unwrap();

        write_shard(&path, &table, 0, 1).unwrap();
        assert_eq!(read_shard(&path, 5).unwrap(), table);
        assert!(read_shard(&path, 6).is_err());
    }

    #[test]
    fn test_empty_shard_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.safetensors");
        let table = TensorTable::new(8);
        write_shard(&path, &table, 1, 2).unwrap();
        assert!(read_shard(&path, 8).unwrap().is_empty());
    }

    #[test]
    fn test_materialize_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let tok = ByteTokenizer;
        let cache = ShardedTensorizationCache::new(&tok, config(dir.path(), true));
        let data = data();

        let outcome = cache.materialize(&data, "unit").unwrap();
        assert_eq!(
            outcome,
            Materialized::Written {
                rows: 10,
                skipped_partitions: vec![]
            }
        );

        let all = cache.load("unit", data.len(), ShardSelection::All).unwrap();
        assert_eq!(all.len(), 10);
        let rank0 = cache.load("unit", data.len(), ShardSelection::Rank(0)).unwrap();
        let rank1 = cache.load("unit", data.len(), ShardSelection::Rank(1)).unwrap();
        assert_eq!(rank0.len(), 5);
        assert_eq!(rank1.len(), 5);
        assert_eq!(&all.rows()[..5], rank0.rows());
    }

    #[test]
    fn test_materialize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let tok = ByteTokenizer;
        let cache = ShardedTensorizationCache::new(&tok, config(dir.path(), true));
        let data = data();

        cache.materialize(&data, "unit").unwrap();
        let before = cache.load("unit", data.len(), ShardSelection::All).unwrap();
        assert_eq!(cache.materialize(&data, "unit").unwrap(), Materialized::AlreadyPresent);
        let after = cache.load("unit", data.len(), ShardSelection::All).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_materialize_is_reproducible() {
        let tok = ByteTokenizer;
        let data = data();
        let mut tables = Vec::new();
        for _ in 0..2 {
            let dir = tempfile::tempdir().unwrap();
            let cache = ShardedTensorizationCache::new(&tok, config(dir.path(), true));
            cache.materialize(&data, "unit").unwrap();
            tables.push(cache.load("unit", data.len(), ShardSelection::All).unwrap());
        }
        assert_eq!(tables[0], tables[1]);
    }

    #[test]
    fn test_budget_failure_skips_only_its_partition() {
        let dir = tempfile::tempdir().unwrap();
        let tok = ByteTokenizer;
        let cache = ShardedTensorizationCache::new(&tok, config(dir.path(), true));
        let mut data = data();
        data.push(TrainingExample::new("c", "x", "y".repeat(100)));
        data.push(TrainingExample::new("c", "x", "y"));
        data.push(TrainingExample::new("c", "x", "z"));

        match cache.materialize(&data, "unit").unwrap() {
            Materialized::Written {
                rows,
                skipped_partitions,
            } => {
                assert_eq!(rows, 10);
                assert_eq!(skipped_partitions, vec!["c".to_string()]);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_insufficient_pool_names_its_partition() {
        let dir = tempfile::tempdir().unwrap();
        let tok = ByteTokenizer;
        let cache = ShardedTensorizationCache::new(&tok, config(dir.path(), true));
        let mut data = data();
        // k = 2 needs at least 3 examples per task
        data.push(TrainingExample::new("c", "x", "y"));
        data.push(TrainingExample::new("c", "x", "z"));

        let err = cache.materialize(&data, "unit").unwrap_err();
        match &err {
            MetaIclError::Partition { name, source } => {
                assert_eq!(name, "c");
                assert!(matches!(**source, MetaIclError::InsufficientPool { pool_size: 2, k: 2 }));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(err.to_string().contains("partition c"));
    }

    #[test]
    fn test_load_before_materialize() {
        let dir = tempfile::tempdir().unwrap();
        let tok = ByteTokenizer;
        let cache = ShardedTensorizationCache::new(&tok, config(dir.path(), true));
        let err = cache.load("unit", 10, ShardSelection::Rank(1)).unwrap_err();
        assert!(matches!(err, MetaIclError::MissingShard(_)));
    }
}
