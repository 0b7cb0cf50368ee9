
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, UdpSocket};

use herd::agent::{AgentSignal, AgentState, HerdAgent};
use herd::discovery::{Broadcaster, Datagram};
use herd::protocol::{EndStatus, JobFile, JobQuery, MessageStream, Record};
use herd::HerdError;
use test_harness::{test_agent_config, TestAgent};

const IDLE: Duration = Duration::from_secs(5);

fn sleep_job() -> JobQuery {
    JobQuery {
        name: "sleeper".to_string(),
        exe: "/bin/sh".to_string(),
        args: Vec::new(),
        config: JobFile::new("sleep.sh", "exec sleep 30\n"),
        inputs: Vec::new(),
        outputs: Vec::new(),
    }
}

async fn start_job(agent: &TestAgent, query: JobQuery) -> MessageStream<TcpStream> {
    let stream = TcpStream::connect(agent.job_addr).await.unwrap();
    let mut stream = MessageStream::new(stream);
    stream.send_record(&Record::from(query)).await.unwrap();
    match stream.recv_record(IDLE).await.unwrap() {
        Some(Record::Ack(name)) => assert_eq!(name, "sleeper"),
        other => panic!("expected Ack, got {:?}", other),
    }
    stream
}

/// Read until the end record, skipping heartbeats.
async fn read_end(stream: &mut MessageStream<TcpStream>) -> herd::protocol::JobEnd {
    loop {
        match stream.recv_record(IDLE).await.unwrap() {
            Some(Record::Alive) => continue,
            Some(Record::End(end)) => return end,
            other => panic!("expected End, got {:?}", other),
        }
    }
}

async fn send_quit(agent: &TestAgent) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket
        .send_to(&Datagram::Quit.encode(), agent.discovery_addr)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_probe_reserves_agent_once() {
    let mut agent = TestAgent::spawn(2).await;
    let broadcaster = Broadcaster::bind(agent.discovery_addr).await.unwrap();

    broadcaster.probe().await.unwrap();
    let (from, reply) = tokio::time::timeout(IDLE, broadcaster.recv_reply())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(from.port(), agent.discovery_addr.port());
    assert_eq!(reply.cores, 2);
    assert_eq!(reply.job_port, Some(agent.job_addr.port()));
    agent.wait_for_state(AgentState::Discovered).await;

    // A reserved agent no longer answers probes.
    broadcaster.probe().await.unwrap();
    let second = tokio::time::timeout(Duration::from_millis(300), broadcaster.recv_reply()).await;
    assert!(second.is_err(), "reserved agent answered a probe");

    agent.stop().await;
}

#[tokio::test]
async fn test_unclaimed_reservation_expires() {
    let mut agent = TestAgent::spawn(1).await;
    let broadcaster = Broadcaster::bind(agent.discovery_addr).await.unwrap();
    broadcaster.probe().await.unwrap();

    agent.wait_for_state(AgentState::Discovered).await;
    let seen = agent.wait_for_state(AgentState::Available).await;
    assert_eq!(seen.last().unwrap().signal, AgentSignal::ReservationExpired);

    agent.stop().await;
}

#[tokio::test]
async fn test_free_releases_reservation() {
    let mut agent = TestAgent::spawn(1).await;
    let broadcaster = Broadcaster::bind(agent.discovery_addr).await.unwrap();
    broadcaster.probe().await.unwrap();
    agent.wait_for_state(AgentState::Discovered).await;

    let stream = TcpStream::connect(agent.job_addr).await.unwrap();
    let mut stream = MessageStream::new(stream);
    stream.send_record(&Record::Free).await.unwrap();

    let seen = agent.wait_for_state(AgentState::Available).await;
    let states: Vec<_> = seen.iter().map(|t| t.to).collect();
    assert_eq!(states, vec![AgentState::Busy, AgentState::Available]);

    agent.stop().await;
}

#[tokio::test]
async fn test_quit_cancels_running_job() {
    let mut agent = TestAgent::spawn(1).await;
    let mut stream = start_job(&agent, sleep_job()).await;
    agent.wait_for_state(AgentState::Busy).await;

    send_quit(&agent).await;

    let end = read_end(&mut stream).await;
    assert_eq!(end.status, EndStatus::Cancelled);
    assert!(stream.recv_record(IDLE).await.unwrap().is_none());

    let seen = agent.wait_for_state(AgentState::Available).await;
    let path: Vec<_> = seen.iter().map(|t| (t.from, t.to)).collect();
    assert_eq!(
        path,
        vec![
            (AgentState::Busy, AgentState::Canceling),
            (AgentState::Canceling, AgentState::Available),
        ]
    );

    agent.stop().await;
}

#[tokio::test]
async fn test_busy_agent_rejects_second_job() {
    let mut agent = TestAgent::spawn(1).await;
    let mut first = start_job(&agent, sleep_job()).await;
    agent.wait_for_state(AgentState::Busy).await;

    let second = TcpStream::connect(agent.job_addr).await.unwrap();
    let mut second = MessageStream::new(second);
    second.send_record(&Record::from(sleep_job())).await.unwrap();
    let end = read_end(&mut second).await;
    assert_eq!(end.status, EndStatus::Rejected);

    // The first job is unaffected until cancelled.
    send_quit(&agent).await;
    assert_eq!(read_end(&mut first).await.status, EndStatus::Cancelled);
    agent.wait_for_state(AgentState::Available).await;

    agent.stop().await;
}

#[tokio::test]
async fn test_dispatcher_drop_cancels_job() {
    let mut agent = TestAgent::spawn(1).await;
    let stream = start_job(&agent, sleep_job()).await;
    agent.wait_for_state(AgentState::Busy).await;

    drop(stream);

    let seen = agent.wait_for_state(AgentState::Available).await;
    assert_eq!(seen.last().unwrap().signal, AgentSignal::SessionFinished);

    agent.stop().await;
}

#[tokio::test]
async fn test_completed_job_returns_outputs() {
    let agent = TestAgent::spawn(1).await;
    let stream = TcpStream::connect(agent.job_addr).await.unwrap();
    let mut stream = MessageStream::new(stream);
    let query = JobQuery {
        name: "writer".to_string(),
        exe: "/bin/sh".to_string(),
        args: Vec::new(),
        config: JobFile::new("run.sh", "cat data/in.bin > result.bin\n"),
        inputs: vec![JobFile::new("data/in.bin", vec![0u8, 159, 146, 150])],
        outputs: vec!["result.bin".to_string()],
    };
    stream.send_record(&Record::from(query)).await.unwrap();

    assert_eq!(
        stream.recv_record(IDLE).await.unwrap(),
        Some(Record::Ack("writer".to_string()))
    );
    assert_eq!(read_end(&mut stream).await.status, EndStatus::Completed);
    assert_eq!(
        stream.recv_record(IDLE).await.unwrap(),
        Some(Record::File(JobFile::new(
            "result.bin",
            vec![0u8, 159, 146, 150]
        )))
    );
    assert!(stream.recv_record(IDLE).await.unwrap().is_none());

    agent.stop().await;
}

#[tokio::test]
async fn test_taken_discovery_port_is_fatal() {
    let taken = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let mut config = test_agent_config(1, scratch.path());
    config.discovery_addr = taken.local_addr().unwrap();

    let result = HerdAgent::bind(config).await;
    assert!(matches!(
        result,
        Err(HerdError::Bind {
            what: "discovery port",
            ..
        })
    ));
}

#[tokio::test]
async fn test_taken_job_port_is_fatal() {
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let mut config = test_agent_config(1, scratch.path());
    config.job_addr = taken.local_addr().unwrap();

    let result = HerdAgent::bind(config).await;
    assert!(matches!(
        result,
        Err(HerdError::Bind {
            what: "job port",
            ..
        })
    ));
}
