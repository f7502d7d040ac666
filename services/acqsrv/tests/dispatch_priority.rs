//! Priority ordering on a busy connection
//!
//! While a background read is on the wire, a queued write must overtake a
//! queued read even though the read was submitted first. The mock transport
//! enforces the order: replies are scripted for write-before-read, so a
//! wrong dispatch order fails the exchange.

mod common;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use acqsrv::config::RegisterType;
use acqsrv::dispatch::{
    Command, PRIORITY_BACKGROUND_READ, PRIORITY_WRITE,
};
use acqsrv::manager::ConnectionManager;
use common::{single_connection_config, tcp_connection};
use pump_modbus::frame::build_tcp_frame;
use pump_modbus::pdu::{self, FunctionCode};
use pump_modbus::transport::{MockTransport, ScriptedExchange};
use pump_modbus::{ModbusError, Transport};

fn holding_reply(transaction: u16, values: &[u16]) -> Vec<u8> {
    let pdu = pdu::build_register_read_response(FunctionCode::ReadHoldingRegisters, values);
    build_tcp_frame(transaction, 1, &pdu)
}

fn write_echo(transaction: u16, address: u16, value: u16) -> Vec<u8> {
    let pdu = pdu::build_write_response(FunctionCode::WriteSingleRegister, address, value);
    build_tcp_frame(transaction, 1, &pdu)
}

#[tokio::test]
async fn write_overtakes_queued_background_read() {
    // Scripted for the order A (slow read), W (write), B (read): if B ran
    // before W the function codes would mismatch and the test would fail
    let transport = MockTransport::with_script(vec![
        ScriptedExchange::delayed_reply(holding_reply(1, &[0x0001]), Duration::from_millis(150)),
        ScriptedExchange::reply(write_echo(2, 5, 0x00FF)),
        ScriptedExchange::reply(holding_reply(3, &[0x0002])),
    ]);

    let queue = Arc::new(Mutex::new(VecDeque::from(vec![transport])));
    let factory = Box::new(move || {
        queue
            .lock()
            .pop_front()
            .map(|t| Box::new(t) as Box<dyn Transport>)
            .ok_or_else(|| ModbusError::Transport("script exhausted".to_string()))
    });

    let config = single_connection_config(tcp_connection("station1", 1502, vec![]));
    let manager = Arc::new(ConnectionManager::new(&config, CancellationToken::new()));
    let spec = manager.spec("station1").unwrap();
    let managed = manager.register_with_factory(spec, factory);

    let read_command = Command::ReadBlock {
        register_type: RegisterType::Holding,
        start: 0,
        count: 1,
    };

    // A goes on the wire and stays there for 150 ms
    let dispatcher_a = Arc::clone(&managed.dispatcher);
    let command_a = read_command.clone();
    let slow_read = tokio::spawn(async move {
        dispatcher_a
            .submit(command_a, PRIORITY_BACKGROUND_READ, Duration::from_secs(2))
            .await
    });
    tokio::time::sleep(Duration::from_millis(30)).await;

    // B queues first, W second; W has the higher priority
    let completions: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let dispatcher_b = Arc::clone(&managed.dispatcher);
    let completions_b = Arc::clone(&completions);
    let queued_read = tokio::spawn(async move {
        let result = dispatcher_b
            .submit(read_command, PRIORITY_BACKGROUND_READ, Duration::from_secs(2))
            .await;
        completions_b.lock().push("read");
        result
    });

    tokio::time::sleep(Duration::from_millis(10)).await;

    let dispatcher_w = Arc::clone(&managed.dispatcher);
    let completions_w = Arc::clone(&completions);
    let write = tokio::spawn(async move {
        let result = dispatcher_w
            .submit(
                Command::WriteRegister {
                    address: 5,
                    value: 0x00FF,
                },
                PRIORITY_WRITE,
                Duration::from_secs(2),
            )
            .await;
        completions_w.lock().push("write");
        result
    });

    assert!(slow_read.await.unwrap().is_ok());
    assert!(write.await.unwrap().is_ok());
    assert!(queued_read.await.unwrap().is_ok());

    assert_eq!(*completions.lock(), vec!["write", "read"]);
}

#[tokio::test]
async fn cancelled_request_never_touches_the_wire() {
    // Only the slow read is scripted; a dispatched second request would
    // error with "unscripted request"
    let transport = MockTransport::with_script(vec![ScriptedExchange::delayed_reply(
        holding_reply(1, &[0x0001]),
        Duration::from_millis(200),
    )]);

    let queue = Arc::new(Mutex::new(VecDeque::from(vec![transport])));
    let factory = Box::new(move || {
        queue
            .lock()
            .pop_front()
            .map(|t| Box::new(t) as Box<dyn Transport>)
            .ok_or_else(|| ModbusError::Transport("script exhausted".to_string()))
    });

    let config = single_connection_config(tcp_connection("station1", 1502, vec![]));
    let manager = Arc::new(ConnectionManager::new(&config, CancellationToken::new()));
    let spec = manager.spec("station1").unwrap();
    let managed = manager.register_with_factory(spec, factory);

    let dispatcher_a = Arc::clone(&managed.dispatcher);
    let slow_read = tokio::spawn(async move {
        dispatcher_a
            .submit(
                Command::ReadBlock {
                    register_type: RegisterType::Holding,
                    start: 0,
                    count: 1,
                },
                PRIORITY_BACKGROUND_READ,
                Duration::from_secs(2),
            )
            .await
    });
    tokio::time::sleep(Duration::from_millis(30)).await;

    // This one times out while still queued and is skipped by the consumer
    let timed_out = managed
        .dispatcher
        .submit(
            Command::ReadBlock {
                register_type: RegisterType::Holding,
                start: 10,
                count: 1,
            },
            PRIORITY_BACKGROUND_READ,
            Duration::from_millis(50),
        )
        .await;
    assert!(timed_out.is_err());

    // The in-flight read still completes cleanly
    assert!(slow_read.await.unwrap().is_ok());

    // Give the consumer a beat; the cancelled request must not have been
    // executed against the transport
    tokio::time::sleep(Duration::from_millis(50)).await;
    let stats = managed.connection.stats();
    assert_eq!(stats.requests, 1);
}
