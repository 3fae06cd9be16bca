//! Queue listener tests against the mock backend.

use sqlcall::driver::mock::{MockDriver, MockExecution};
use sqlcall::{DbConfig, DbError, MessageHandler, QueueListener, SqlValue};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn setup() -> (MockDriver, DbConfig) {
    let driver = MockDriver::new();
    let conf = DbConfig::new(Arc::new(driver.clone()), "Server=.;Database=queue");
    (driver, conf)
}

fn polling_command(conf: &DbConfig) -> sqlcall::Command {
    let mut cmd = conf.stored_procedure("spReceiveMessage");
    cmd.set_timeout_secs(600);
    cmd
}

#[tokio::test]
async fn test_receives_rows_and_commits() {
    let (driver, conf) = setup();
    driver.push(MockExecution::new().with_result_set(
        &["MessageID", "Body"],
        vec![
            vec![SqlValue::Int(1), SqlValue::from("first")],
            vec![SqlValue::Int(2), SqlValue::from("second")],
        ],
    ));
    // the follow-up receive blocks until Stop cancels it
    driver.push(MockExecution::blocking_until_cancel());

    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler: MessageHandler = Arc::new(move |rows| {
        sink.lock().unwrap().push(rows.get::<String>("Body")?);
        Ok(())
    });

    let mut listener = QueueListener::new(polling_command(&conf), handler).unwrap();
    listener.start().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    listener.stop().await;

    assert_eq!(&*seen.lock().unwrap(), &["first", "second"]);

    let log = driver.log();
    assert_eq!(log.commits, 1);
    // the receive transaction runs far longer than engine defaults
    assert_eq!(log.begun[0], Duration::from_secs(3600));
    // every receive enlists in the distributed coordinator up front
    assert!(log.enlists >= 1);
    assert_eq!(driver.remaining(), 0);
}

#[tokio::test]
async fn test_handler_failure_rolls_back_without_commit() {
    let (driver, conf) = setup();
    driver.push(MockExecution::new().with_result_set(
        &["MessageID"],
        vec![vec![SqlValue::Int(1)]],
    ));

    let handler: MessageHandler = Arc::new(|_| Err(DbError::usage("handler rejected message")));

    let mut listener = QueueListener::new(polling_command(&conf), handler).unwrap();
    listener.start().unwrap();
    // the failed iteration enters its backoff; stop interrupts it
    tokio::time::sleep(Duration::from_millis(100)).await;
    listener.stop().await;

    let log = driver.log();
    assert_eq!(log.commits, 0);
    // closing without commit returns the message to the queue
    assert_eq!(log.closes, 1);
}

#[tokio::test(start_paused = true)]
async fn test_fault_backs_off_then_receives_again() {
    let (driver, conf) = setup();
    driver.push(MockExecution::failing_transport("deadlock victim"));
    driver.push(MockExecution::blocking_until_cancel());

    let handler: MessageHandler = Arc::new(|_| Ok(()));
    let mut listener = QueueListener::new(polling_command(&conf), handler).unwrap();
    listener.start().unwrap();

    // the paused clock fast-forwards through the 5 s backoff; the worker
    // must come back for another receive without a second start
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(driver.remaining(), 0);

    listener.stop().await;
    assert_eq!(driver.log().commits, 0);
}

#[tokio::test]
async fn test_stop_cancels_blocking_receive() {
    let (driver, conf) = setup();
    driver.push(MockExecution::blocking_until_cancel());

    let handler: MessageHandler = Arc::new(|_| Ok(()));
    let mut listener = QueueListener::new(polling_command(&conf), handler).unwrap();
    listener.start().unwrap();
    assert!(listener.is_running());

    tokio::time::sleep(Duration::from_millis(50)).await;
    listener.stop().await;
    assert!(!listener.is_running());
    assert_eq!(driver.log().commits, 0);
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let (_, conf) = setup();
    let handler: MessageHandler = Arc::new(|_| Ok(()));
    let mut listener = QueueListener::new(polling_command(&conf), handler).unwrap();

    listener.start().unwrap();
    assert!(listener.start().is_err());
    listener.stop().await;
}
