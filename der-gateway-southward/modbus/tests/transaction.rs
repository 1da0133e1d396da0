mod common;

use common::{init_tracing, mock_network, test_network_config, Call, UNIT_ID};
use der_driver_modbus::{
    AddressRangeSet, ModbusReadFunction, RegisterMap, RegisterStore, TransactionExecutor,
    WordOrder,
};
use der_gateway_sdk::{DataType, DriverError};
use std::{
    sync::{mpsc, Arc},
    thread,
    time::{Duration, Instant},
};

fn ranges(pairs: &[(u16, u16)]) -> AddressRangeSet {
    let mut set = AddressRangeSet::new();
    for (min, max) in pairs {
        set.add(*min, *max).unwrap();
    }
    set
}

#[test]
fn refresh_combines_and_chunks_requests() {
    init_tracing();
    let (network, factory) = mock_network(test_network_config());
    {
        let mut device = factory.device();
        for a in 0..500u16 {
            device.holdings.insert(a, a);
        }
    }
    let executor = TransactionExecutor::new(Arc::clone(&network), UNIT_ID);
    let store = RegisterStore::new(WordOrder::MostToLeastSignificant);
    let set = ranges(&[(0, 1), (3, 5), (20, 28), (404, 406), (412, 418)]);

    let snapshot = executor
        .refresh(&store, ModbusReadFunction::ReadHoldingRegisters, &set, 16)
        .unwrap();

    let reads: Vec<(u16, u16)> = factory
        .device()
        .requests()
        .into_iter()
        .map(|c| match c {
            Call::ReadWords { address, count, .. } => (address, count),
            other => panic!("unexpected call {other:?}"),
        })
        .collect();
    // {0-5} and {404-418} combine under a cap of 16; {20-28} stays apart
    assert_eq!(reads, vec![(0, 6), (20, 9), (404, 15)]);
    assert_eq!(snapshot.word(418), Some(418));
    assert_eq!(snapshot.word(10), None);
    assert!(snapshot.timestamp().is_some());
    assert_eq!(store.copy(), snapshot);
    // one lock round trip
    assert_eq!(factory.device().count(&Call::Open), 1);
}

#[test]
fn long_ranges_are_split_to_max_length() {
    let (network, factory) = mock_network(test_network_config());
    let executor = TransactionExecutor::new(network, UNIT_ID);
    let store = RegisterStore::default();
    executor
        .refresh(
            &store,
            ModbusReadFunction::ReadInputRegisters,
            &ranges(&[(100, 229)]),
            64,
        )
        .unwrap();
    let counts: Vec<u16> = factory
        .device()
        .requests()
        .into_iter()
        .filter_map(|c| match c {
            Call::ReadWords { count, .. } => Some(count),
            _ => None,
        })
        .collect();
    assert_eq!(counts, vec![64, 64, 2]);
    assert_eq!(store.read(|d| d.len()), 130);
}

#[test]
fn failed_read_leaves_store_untouched() {
    let mut config = test_network_config();
    config.retry = der_gateway_sdk::RetryPolicy::no_retry();
    let (network, factory) = mock_network(config);
    let executor = TransactionExecutor::new(network, UNIT_ID);
    let store = RegisterStore::default();
    store
        .update(|tx| {
            tx.save_words(0, &[1, 2, 3])?;
            Ok(true)
        })
        .unwrap();
    let before = store.copy();

    factory.device().fail_requests = 1;
    let err = executor
        .refresh(
            &store,
            ModbusReadFunction::ReadHoldingRegisters,
            &ranges(&[(0, 2)]),
            64,
        )
        .unwrap_err();
    assert!(matches!(err, DriverError::TransportError(_)));
    assert_eq!(store.copy(), before);
}

fn device_reads(factory: &common::MockFactory) -> usize {
    factory
        .device()
        .requests()
        .iter()
        .filter(|c| matches!(c, Call::ReadWords { .. }))
        .count()
}

#[test]
fn commit_happens_before_the_transport_is_released() {
    init_tracing();
    let (network, factory) = mock_network(test_network_config());
    factory.device().holdings.insert(0, 1);
    let store = Arc::new(RegisterStore::default());
    let set = ranges(&[(0, 0)]);

    // hold the store's write side so the first commit has to wait
    let (held_tx, held_rx) = mpsc::channel();
    let blocker = thread::spawn({
        let store = Arc::clone(&store);
        move || {
            store
                .update(|_| {
                    held_tx.send(()).unwrap();
                    thread::sleep(Duration::from_millis(400));
                    Ok(false)
                })
                .unwrap();
        }
    });
    held_rx.recv().unwrap();

    let first = thread::spawn({
        let executor = TransactionExecutor::new(Arc::clone(&network), UNIT_ID);
        let (store, set) = (Arc::clone(&store), set.clone());
        move || {
            executor
                .refresh(&store, ModbusReadFunction::ReadHoldingRegisters, &set, 64)
                .unwrap()
        }
    });
    let deadline = Instant::now() + Duration::from_secs(2);
    while device_reads(&factory) == 0 {
        assert!(Instant::now() < deadline, "first read never reached the device");
        thread::sleep(Duration::from_millis(5));
    }
    // read done, commit pending: the transport must still be held
    assert!(network.lock().is_locked());

    factory.device().holdings.insert(0, 2);
    let second = thread::spawn({
        let executor = TransactionExecutor::new(Arc::clone(&network), UNIT_ID);
        let (store, set) = (Arc::clone(&store), set.clone());
        move || {
            executor
                .refresh(&store, ModbusReadFunction::ReadHoldingRegisters, &set, 64)
                .unwrap()
        }
    });
    thread::sleep(Duration::from_millis(100));
    assert_eq!(device_reads(&factory), 1);
    assert!(network.lock().is_locked());

    blocker.join().unwrap();
    assert_eq!(first.join().unwrap().word(0), Some(1));
    assert_eq!(second.join().unwrap().word(0), Some(2));
    assert_eq!(device_reads(&factory), 2);
    assert_eq!(store.copy().word(0), Some(2));
}

#[test]
fn bit_reads_use_absolute_addresses() {
    let (network, factory) = mock_network(test_network_config());
    factory.device().discretes.insert(10, true);
    factory.device().discretes.insert(12, true);
    let executor = TransactionExecutor::new(network, UNIT_ID);

    let bits = executor
        .read_bits(
            ModbusReadFunction::ReadDiscreteInputs,
            &ranges(&[(10, 12)]),
            64,
        )
        .unwrap();
    assert_eq!(bits.iter_ones().collect::<Vec<_>>(), vec![10, 12]);

    let store = RegisterStore::default();
    assert!(executor
        .refresh(
            &store,
            ModbusReadFunction::ReadCoils,
            &ranges(&[(0, 1)]),
            64
        )
        .is_err());
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Meter {
    Frequency,
    Energy,
    Model,
}

#[test]
fn register_map_drives_refresh() {
    let (network, factory) = mock_network(test_network_config());
    {
        let mut device = factory.device();
        // 50.0 as float32
        device.inputs.insert(0, 0x4248);
        device.inputs.insert(1, 0x0000);
        device.inputs.insert(8, 0x0000);
        device.inputs.insert(9, 0x0001);
        device.inputs.insert(10, 0x0000);
        device.inputs.insert(11, 0x0002);
        device.inputs.insert(20, 0x4142);
        device.inputs.insert(21, 0x4300);
    }
    let map = RegisterMap::builder()
        .register(Meter::Frequency, ModbusReadFunction::ReadInputRegisters, 0, DataType::Float32)
        .register(Meter::Energy, ModbusReadFunction::ReadInputRegisters, 8, DataType::UInt64)
        .register_with_length(
            Meter::Model,
            ModbusReadFunction::ReadInputRegisters,
            20,
            DataType::StringAscii,
            4,
        )
        .build()
        .unwrap();

    let executor = TransactionExecutor::new(network, UNIT_ID);
    let store = RegisterStore::default();
    let snapshot = executor
        .refresh(
            &store,
            ModbusReadFunction::ReadInputRegisters,
            &map.address_ranges(ModbusReadFunction::ReadInputRegisters),
            64,
        )
        .unwrap();
    let reader = map.reader(&snapshot);
    assert_eq!(reader.f32(&Meter::Frequency).unwrap(), Some(50.0));
    assert_eq!(reader.u64(&Meter::Energy).unwrap(), Some(0x0001_0000_0002));
    assert_eq!(reader.string(&Meter::Model).unwrap().as_deref(), Some("ABC"));
}
