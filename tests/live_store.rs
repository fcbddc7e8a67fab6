use ibrowser::config::RunParameters;
use ibrowser::data::BlockManager;
use ibrowser::io::{LedgerReader, LedgerWriter, MMapStore, OpenMode};
use ibrowser::pipelines::database::{chromosome_store_path, summary_store_path};
use ibrowser::pipelines::{DistanceQueries, IngestCoordinator, Observation};
use ibrowser::{Compression, CounterWidth, IbError};
use ibrowser::data::CounterArray;
use tempfile::tempdir;

fn observation(chrom: &str, position: u64, pairs: &[(u64, u64, u64)]) -> Observation {
    Observation::from_pairs(chrom, 1, position, 5, CounterWidth::W16, pairs.iter().copied())
        .unwrap()
}

fn names() -> Vec<String> {
    (0..5).map(|i| format!("sample_{}", i)).collect()
}

#[test]
fn test_synced_stores_reopen_read_only() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("run");
    let params = RunParameters {
        block_size: 1_000,
        width: CounterWidth::W16,
        ..Default::default()
    };
    let run = IngestCoordinator::new(&prefix, params).unwrap();
    run.ingest(&names(), &observation("chr7", 150, &[(0, 4, 3), (1, 2, 1)])).unwrap();
    run.ingest(&names(), &observation("chr7", 2_500, &[(3, 4, 9)])).unwrap();
    run.finalize().unwrap();

    let mut store = BlockManager::open_existing(chromosome_store_path(&prefix, "chr7")).unwrap();
    assert_eq!(store.domain(), "chr7");
    assert_eq!(store.width(), CounterWidth::W16);
    assert_eq!(store.len(), 3);
    assert_eq!(store.store().register_size(), 10);
    for block in store.blocks() {
        let live = run.block_table("chr7", block.number()).unwrap().unwrap();
        assert_eq!(block.matrix().export_table(), live);
    }
    assert_eq!(store.get_by_number(2).unwrap().matrix().get(3, 4).unwrap(), 9);
    assert!(store.get_by_number(1).unwrap().is_empty());

    assert!(matches!(
        store.new_block(None, 3),
        Err(IbError::ReadOnlyViolation { .. })
    ));

    let summary = BlockManager::open_existing(summary_store_path(&prefix)).unwrap();
    let block = summary.get_by_name("summary").unwrap();
    assert_eq!(block.num_snps(), 2);
    assert_eq!((block.min_position(), block.max_position()), (150, 2_500));
    run.close().unwrap();
}

#[test]
fn test_live_registers_track_ingest() {
    let dir = tempdir().unwrap();
    let prefix = dir.path().join("run");
    let params = RunParameters {
        width: CounterWidth::W16,
        ..Default::default()
    };
    let run = IngestCoordinator::new(&prefix, params).unwrap();
    run.ingest(&names(), &observation("chr1", 10, &[(0, 1, 5)])).unwrap();

    // No sync: the registers already hold what the blocks hold
    {
        let chromosome = run.chromosome("chr1").unwrap();
        let chromosome = chromosome.lock();
        let block = chromosome.get_block(0).unwrap();
        let register = chromosome.manager().store().read_register(0).unwrap();
        assert_eq!(register.to_u64s(), block.matrix().export_table());
        assert_eq!(register.get(0), Some(5));
    }
    let summary = run.with_summary(|b| b.matrix().counters().is_mapped()).unwrap();
    assert!(summary);

    run.ingest(&names(), &observation("chr1", 20, &[(0, 1, 2), (3, 4, 1)])).unwrap();
    let chromosome = run.chromosome("chr1").unwrap();
    let register = chromosome.lock().manager().store().read_register(0).unwrap();
    assert_eq!(register.get(0), Some(7));
    assert_eq!(register.get(9), Some(1));
}

#[test]
fn test_reopen_rejects_reserved_counter() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("chr1.bin");
    {
        let mut manager = BlockManager::new("chr1", &path, CounterWidth::W16, 3, 100).unwrap();
        manager.new_block(None, 0).unwrap();
        manager.close().unwrap();
    }
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[2..4].copy_from_slice(&u16::MAX.to_le_bytes());
    std::fs::write(&path, bytes).unwrap();

    assert!(matches!(
        BlockManager::open_existing(&path),
        Err(IbError::PairOverflow { i: 0, j: 2, value: 65535, .. })
    ));
}

#[test]
fn test_store_grows_and_preserves_registers() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("grow.bin");
    let mut store = MMapStore::open(&path, CounterWidth::W32, 4, OpenMode::ReadWrite).unwrap();
    store.extend(5).unwrap();
    let first = CounterArray::from_u64s(CounterWidth::W32, &[1, 2, 3, 4, 5, 6]).unwrap();
    store.write_register(4, &first).unwrap();
    store.extend(3).unwrap();

    assert_eq!(store.len(), 8);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 8 * 24);
    assert_eq!(store.read_register(4).unwrap(), first);
    assert_eq!(store.read_register(7).unwrap().to_u64s(), vec![0; 6]);
    store.close().unwrap();
}

#[test]
fn test_ledger_records_in_order() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("matrix.bin.gz");
    let records: Vec<CounterArray> = (0..4u64)
        .map(|k| CounterArray::from_u64s(CounterWidth::W64, &[k, k * 2, u64::MAX - k]).unwrap())
        .collect();

    let mut writer = LedgerWriter::open_for_write(&path, Compression::Gzip).unwrap();
    for record in &records {
        writer.write(record).unwrap();
    }
    writer.close().unwrap();

    let mut reader = LedgerReader::open_for_read(&path, Compression::Gzip).unwrap();
    for (serial, expected) in records.iter().enumerate() {
        let record = reader.read(CounterWidth::W64).unwrap();
        assert_eq!(record.header.serial, serial as u64);
        assert_eq!(&record.values, expected);
    }
    let terminal = reader.read(CounterWidth::W64).unwrap();
    assert!(terminal.is_terminal());
    assert_eq!(terminal.values.to_u64s(), vec![0, 0, 0]);
    assert!(matches!(reader.read(CounterWidth::W64), Err(IbError::Closed(_))));
}
