mod common;

use common::{init_tracing, meter_config};
use der_driver_modbus::{
    ModbusConnectionConfig, ModbusNetwork, ModbusNetworkConfig, ModbusReadFunction,
    ModbusWriteFunction, WordOrder,
};
use der_gateway_sdk::{DataType, DriverError, RegisterValue, RetryPolicy};
use der_plugin_modbus_server::ModbusServer;
use std::{
    net::SocketAddr,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

fn client_network(addr: SocketAddr) -> ModbusNetwork {
    let mut config = ModbusNetworkConfig::new(ModbusConnectionConfig::Tcp {
        host: addr.ip().to_string(),
        port: addr.port(),
    });
    config.timeout_ms = 2000;
    config.retry = RetryPolicy::no_retry();
    ModbusNetwork::new(config)
}

/// Run `f` on a plain thread; the blocking client must not run on a runtime worker.
async fn blocking<T, F>(f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let handle = thread::spawn(f);
    tokio::task::spawn_blocking(move || handle.join().unwrap())
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn serves_blocking_driver_over_tcp() {
    init_tracing();
    let server = Arc::new(ModbusServer::new(meter_config(true)).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let task = {
        let server = Arc::clone(&server);
        let cancel = cancel.clone();
        tokio::spawn(async move { server.serve_listener(listener, cancel).await })
    };

    let (voltage, serial, relay) = blocking(move || {
        let network = client_network(addr);
        let voltage = network.perform_action(1, |conn| {
            conn.read_value(
                ModbusReadFunction::ReadHoldingRegisters,
                DataType::Float32,
                0,
                0,
                WordOrder::MostToLeastSignificant,
            )
        })?;
        let serial = network.perform_action(1, |conn| {
            conn.read_value(
                ModbusReadFunction::ReadInputRegisters,
                DataType::StringAscii,
                100,
                3,
                WordOrder::MostToLeastSignificant,
            )
        })?;
        let relay = network.perform_action(1, |conn| {
            conn.write_words(ModbusWriteFunction::WriteMultipleRegisters, 20, &[0xAA, 0xBB])?;
            conn.read_bits(ModbusReadFunction::ReadCoils, 0, 2)
        })?;
        Ok::<_, DriverError>((voltage, serial, relay))
    })
    .await
    .unwrap();

    assert_eq!(voltage, Some(RegisterValue::Float32(230.5)));
    assert_eq!(serial, Some(RegisterValue::String("SN01".into())));
    assert_eq!(relay, vec![false, true]);
    let bank = server.registry().get(1).unwrap();
    assert_eq!(bank.read_holdings(20, 2), vec![0xAA, 0xBB]);

    cancel.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_unit_surfaces_as_exception() {
    let server = Arc::new(ModbusServer::new(meter_config(false)).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let task = {
        let server = Arc::clone(&server);
        let cancel = cancel.clone();
        tokio::spawn(async move { server.serve_listener(listener, cancel).await })
    };

    let (unknown, rejected) = blocking(move || {
        let network = client_network(addr);
        let unknown = network.perform_action(42, |conn| {
            conn.read_words(ModbusReadFunction::ReadHoldingRegisters, 0, 1)
        });
        let rejected = network.perform_action(1, |conn| {
            conn.write_words(ModbusWriteFunction::WriteSingleRegister, 0, &[1])
        });
        (unknown, rejected)
    })
    .await;

    assert!(matches!(
        unknown,
        Err(DriverError::ModbusException { unit_id: 42, .. })
    ));
    assert!(matches!(
        rejected,
        Err(DriverError::ModbusException { unit_id: 1, .. })
    ));
    assert_eq!(server.registry().get(1).unwrap().read_holdings(0, 1), vec![0x4366]);

    cancel.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn connection_requests_are_throttled() {
    let mut config = meter_config(false);
    config.request_throttle_ms = 250;
    let server = Arc::new(ModbusServer::new(config).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let task = {
        let server = Arc::clone(&server);
        let cancel = cancel.clone();
        tokio::spawn(async move { server.serve_listener(listener, cancel).await })
    };

    let (words, elapsed) = blocking(move || {
        let network = client_network(addr);
        let started = Instant::now();
        let words = network.perform_action(1, |conn| {
            let mut words = Vec::new();
            for address in 0..3 {
                words.extend(conn.read_words(
                    ModbusReadFunction::ReadHoldingRegisters,
                    address,
                    1,
                )?);
            }
            Ok(words)
        });
        (words, started.elapsed())
    })
    .await;

    assert_eq!(words.unwrap(), vec![0x4366, 0x8000, 7]);
    // three requests on one connection: two throttle intervals
    assert!(elapsed >= Duration::from_millis(500), "elapsed {elapsed:?}");

    cancel.cancel();
    task.await.unwrap().unwrap();
}
