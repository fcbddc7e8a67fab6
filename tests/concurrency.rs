use std::sync::Arc;
use std::thread;

use ibrowser::config::RunParameters;
use ibrowser::data::Block;
use ibrowser::pipelines::{
    ingest_partitioned, ChromosomeFeed, DistanceQueries, IngestCoordinator, Observation,
};
use ibrowser::{CounterWidth, DistanceMatrix, IbError};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tempfile::tempdir;

const SAMPLES: u64 = 7;

// --- Helpers ---

fn random_deltas(rng: &mut StdRng, count: usize) -> Vec<(u64, DistanceMatrix)> {
    (0..count)
        .map(|_| {
            let mut delta = DistanceMatrix::new("chr1", 1000, SAMPLES, 0, 0, CounterWidth::W32);
            for i in 0..SAMPLES {
                for j in (i + 1)..SAMPLES {
                    delta.set(i, j, rng.gen_range(0..4)).unwrap();
                }
            }
            (rng.gen_range(0..1000), delta)
        })
        .collect()
}

fn sequential(deltas: &[(u64, DistanceMatrix)]) -> Block {
    let mut block = Block::new("chr1", None, 1000, CounterWidth::W32, SAMPLES, 0, 0);
    for (position, delta) in deltas {
        block.accumulate(*position, delta).unwrap();
    }
    block
}

fn concurrent(deltas: &[(u64, DistanceMatrix)], workers: usize) -> Block {
    let block = Arc::new(Block::new("chr1", None, 1000, CounterWidth::W32, SAMPLES, 0, 0));
    let chunk = deltas.len().div_ceil(workers);
    thread::scope(|scope| {
        for part in deltas.chunks(chunk) {
            let block = Arc::clone(&block);
            scope.spawn(move || {
                for (position, delta) in part {
                    block.accumulate_atomic(*position, delta).unwrap();
                }
            });
        }
    });
    Arc::try_unwrap(block).unwrap()
}

fn assert_identical(a: &Block, b: &Block) {
    assert_eq!(a.matrix().export_table(), b.matrix().export_table());
    assert_eq!(a.num_snps(), b.num_snps());
    assert_eq!(a.min_position(), b.min_position());
    assert_eq!(a.max_position(), b.max_position());
    assert!(a.is_equal(b));
}

// --- Tests ---

#[test]
fn test_accumulation_order_does_not_matter() {
    let mut rng = StdRng::seed_from_u64(42);
    let mut deltas = random_deltas(&mut rng, 300);
    let reference = sequential(&deltas);

    for _ in 0..5 {
        deltas.shuffle(&mut rng);
        assert_identical(&reference, &sequential(&deltas));
        assert_identical(&reference, &concurrent(&deltas, 4));
    }
}

#[test]
fn test_concurrent_ingest_matches_sequential() {
    let mut rng = StdRng::seed_from_u64(7);
    let names: Vec<String> = (0..SAMPLES).map(|i| format!("s{}", i)).collect();
    let chromosomes = ["chr1", "chr2", "chr3", "chr4"];

    // Sorted positions per chromosome, as a caller streaming a VCF would see them
    let mut feeds: Vec<Vec<Observation>> = Vec::new();
    for (c, chrom) in chromosomes.iter().enumerate() {
        let mut positions: Vec<u64> = (0..60).map(|_| rng.gen_range(0..5_000)).collect();
        positions.sort_unstable();
        let observations = positions
            .into_iter()
            .map(|position| {
                let pairs: Vec<(u64, u64, u64)> = (0..5)
                    .map(|_| {
                        let i = rng.gen_range(0..SAMPLES - 1);
                        let j = rng.gen_range(i + 1..SAMPLES);
                        (i, j, rng.gen_range(1..3))
                    })
                    .collect();
                Observation::from_pairs(*chrom, c as u64 + 1, position, SAMPLES, CounterWidth::W32, pairs)
                    .unwrap()
            })
            .collect();
        feeds.push(observations);
    }

    let params = RunParameters {
        block_size: 1_000,
        ..Default::default()
    };
    let dir = tempdir().unwrap();

    let serial = IngestCoordinator::new(dir.path().join("serial"), params.clone()).unwrap();
    for observations in &feeds {
        for observation in observations {
            serial.ingest(&names, observation).unwrap();
        }
    }

    let parallel = IngestCoordinator::new(dir.path().join("parallel"), params).unwrap();
    let inputs = chromosomes
        .iter()
        .zip(feeds.iter())
        .map(|(chrom, observations)| ChromosomeFeed {
            name: chrom.to_string(),
            num_registers: 6,
            observations: observations.iter().cloned().map(Ok::<_, IbError>).collect::<Vec<_>>(),
        })
        .collect();
    ingest_partitioned(&parallel, &names, inputs, Some(3)).unwrap();

    serial.finalize().unwrap();
    parallel.finalize().unwrap();

    assert_eq!(serial.counters(), parallel.counters());
    assert_eq!(serial.summary_table().unwrap(), parallel.summary_table().unwrap());
    let summary_serial = serial.summary_block().unwrap().unwrap();
    let summary_parallel = parallel.summary_block().unwrap().unwrap();
    assert_eq!(summary_serial.num_snps, summary_parallel.num_snps);
    assert_eq!(summary_serial.min_position, summary_parallel.min_position);
    assert_eq!(summary_serial.max_position, summary_parallel.max_position);

    for chrom in chromosomes {
        assert_eq!(
            serial.chromosome_table(chrom).unwrap(),
            parallel.chromosome_table(chrom).unwrap()
        );
        for number in 0..5 {
            assert_eq!(serial.block(chrom, number).unwrap(), parallel.block(chrom, number).unwrap());
            assert_eq!(
                serial.block_table(chrom, number).unwrap(),
                parallel.block_table(chrom, number).unwrap()
            );
        }
    }
}
