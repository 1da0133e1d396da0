mod common;

use common::{init_tracing, meter_config, meter_registry};
use der_driver_modbus::RegisterBlockType;
use der_gateway_sdk::{DataType, RegisterValue};
use der_plugin_modbus_server::{ModbusRequestService, UnitRegistry};
use std::{
    borrow::Cow,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio_modbus::{server::Service, ExceptionCode, Request, Response, SlaveRequest};

fn service(allow_writes: bool, auto_create_units: bool) -> ModbusRequestService {
    let config = meter_config(allow_writes);
    ModbusRequestService::new(meter_registry(&config), allow_writes, auto_create_units)
}

async fn call(
    service: &ModbusRequestService,
    slave: u8,
    request: Request<'static>,
) -> Result<Response, ExceptionCode> {
    service.call(SlaveRequest { slave, request }).await
}

#[tokio::test]
async fn reads_seeded_registers() {
    init_tracing();
    let service = service(false, false);
    assert_eq!(
        call(&service, 1, Request::ReadHoldingRegisters(0, 4)).await,
        Ok(Response::ReadHoldingRegisters(vec![0x4366, 0x8000, 7, 0]))
    );
    assert_eq!(
        call(&service, 1, Request::ReadInputRegisters(100, 3)).await,
        Ok(Response::ReadInputRegisters(vec![0x534E, 0x3031, 0]))
    );
    assert_eq!(
        call(&service, 1, Request::ReadCoils(0, 3)).await,
        Ok(Response::ReadCoils(vec![false, true, false]))
    );
    assert_eq!(
        call(&service, 1, Request::ReadDiscreteInputs(0, 2)).await,
        Ok(Response::ReadDiscreteInputs(vec![false, false]))
    );
}

#[tokio::test]
async fn writes_rejected_unless_allowed() {
    let service = service(false, false);
    assert_eq!(
        call(&service, 1, Request::WriteSingleRegister(2, 9)).await,
        Err(ExceptionCode::IllegalFunction)
    );
    assert_eq!(
        call(&service, 1, Request::WriteSingleCoil(0, true)).await,
        Err(ExceptionCode::IllegalFunction)
    );
    let bank = service.registry().get(1).unwrap();
    assert_eq!(bank.read_holdings(2, 1), vec![7]);
    assert!(!bank.read_coils(0, 1).get(0));
}

#[tokio::test]
async fn writes_update_bank_when_allowed() {
    let service = service(true, false);
    assert_eq!(
        call(
            &service,
            1,
            Request::WriteMultipleRegisters(10, Cow::Owned(vec![1, 2, 3]))
        )
        .await,
        Ok(Response::WriteMultipleRegisters(10, 3))
    );
    assert_eq!(
        call(&service, 1, Request::WriteSingleRegister(2, 9)).await,
        Ok(Response::WriteSingleRegister(2, 9))
    );
    assert_eq!(
        call(
            &service,
            1,
            Request::WriteMultipleCoils(5, Cow::Owned(vec![true, true]))
        )
        .await,
        Ok(Response::WriteMultipleCoils(5, 2))
    );

    let bank = service.registry().get(1).unwrap();
    assert_eq!(bank.read_holdings(10, 3), vec![1, 2, 3]);
    assert_eq!(bank.read_holdings(2, 1), vec![9]);
    assert_eq!(bank.read_coils(5, 2).to_bools(2), vec![true, true]);
    // float written at start-up is still intact
    assert_eq!(
        bank.store(RegisterBlockType::Holding)
            .unwrap()
            .get_value(DataType::Float32, 0, 0)
            .unwrap(),
        Some(RegisterValue::Float32(230.5))
    );
}

#[tokio::test]
async fn unknown_units_and_bad_ranges() {
    let strict = service(true, false);
    assert_eq!(
        call(&strict, 9, Request::ReadHoldingRegisters(0, 1)).await,
        Err(ExceptionCode::GatewayTargetDevice)
    );
    assert_eq!(
        call(&strict, 1, Request::ReadHoldingRegisters(65535, 2)).await,
        Err(ExceptionCode::IllegalDataAddress)
    );
    assert_eq!(
        call(
            &strict,
            1,
            Request::WriteMultipleRegisters(65535, Cow::Owned(vec![1, 2]))
        )
        .await,
        Err(ExceptionCode::IllegalDataAddress)
    );
    assert_eq!(
        call(&strict, 1, Request::ReadCoils(0, 0)).await,
        Err(ExceptionCode::IllegalDataAddress)
    );
    assert_eq!(
        call(&strict, 1, Request::MaskWriteRegister(0, 0xFF00, 0x0012)).await,
        Err(ExceptionCode::IllegalFunction)
    );

    let lenient = ModbusRequestService::new(Arc::new(UnitRegistry::default()), false, true);
    assert_eq!(
        call(&lenient, 9, Request::ReadInputRegisters(0, 2)).await,
        Ok(Response::ReadInputRegisters(vec![0, 0]))
    );
    assert_eq!(lenient.registry().unit_ids(), vec![9]);
}

#[tokio::test]
async fn requests_on_one_connection_are_spaced_out() {
    let service = service(false, false).with_request_throttle(Duration::from_millis(200));
    let read = || Request::ReadHoldingRegisters(2, 1);

    let started = Instant::now();
    call(&service, 1, read()).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(150));
    call(&service, 1, read()).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(200));

    // another connection has its own throttle state
    let other = service.for_connection();
    assert_eq!(other.request_throttle(), Duration::from_millis(200));
    let started = Instant::now();
    assert_eq!(
        call(&other, 1, read()).await,
        Ok(Response::ReadHoldingRegisters(vec![7]))
    );
    assert!(started.elapsed() < Duration::from_millis(150));
}
