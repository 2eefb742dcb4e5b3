//! Framed codec behavior over real async streams.

use prexd::error::PrexdError;
use prexd::protocol::{frame, ErrResponse, TaskRequest};
use prexd::shmem::MAX_SCRIPT_SIZE;

#[tokio::test]
async fn frames_round_trip_over_a_stream() {
    let (mut client, mut server) = tokio::io::duplex(256);

    let payloads: Vec<Vec<u8>> = vec![
        b"{}".to_vec(),
        b"print(42)".to_vec(),
        vec![0xAB; 10_000],
    ];

    let expected = payloads.clone();
    let writer = tokio::spawn(async move {
        for payload in payloads {
            frame::write_frame(&mut client, &payload).await.unwrap();
        }
    });

    for expected in &expected {
        let got = frame::read_frame(&mut server).await.unwrap();
        assert_eq!(&got, expected);
    }
    writer.await.unwrap();
}

#[tokio::test]
async fn json_payloads_survive_the_wire() {
    let (mut client, mut server) = tokio::io::duplex(256);

    let request = TaskRequest {
        id: 12,
        len: 9,
        lang: prexd::lang::Lang::Python,
        task_id: 1,
        num_tasks: 3,
        timeout: 30,
    };
    let payload = serde_json::to_vec(&request).unwrap();
    frame::write_frame(&mut client, &payload).await.unwrap();

    let got = frame::read_frame(&mut server).await.unwrap();
    let decoded: TaskRequest = serde_json::from_slice(&got).unwrap();
    assert_eq!(decoded, request);

    let response = serde_json::to_vec(&ErrResponse { err: -3 }).unwrap();
    frame::write_frame(&mut server, &response).await.unwrap();
    let got = frame::read_frame(&mut client).await.unwrap();
    let decoded: ErrResponse = serde_json::from_slice(&got).unwrap();
    assert_eq!(decoded.err, -3);
}

#[tokio::test]
async fn oversized_header_fails_the_codec() {
    let (mut client, mut server) = tokio::io::duplex(256);

    let bogus = format!("{}\n", MAX_SCRIPT_SIZE + 1);
    tokio::io::AsyncWriteExt::write_all(&mut client, bogus.as_bytes())
        .await
        .unwrap();

    assert!(matches!(
        frame::read_frame(&mut server).await,
        Err(PrexdError::MalformedHeader)
    ));
}

#[tokio::test]
async fn truncated_frame_is_malformed() {
    let (mut client, mut server) = tokio::io::duplex(256);

    tokio::io::AsyncWriteExt::write_all(&mut client, b"100\npartial")
        .await
        .unwrap();
    drop(client);

    assert!(matches!(
        frame::read_frame(&mut server).await,
        Err(PrexdError::MalformedPayload(_))
    ));
}

#[tokio::test]
async fn clean_close_between_frames_is_eof() {
    let (client, mut server) = tokio::io::duplex(256);
    drop(client);

    match frame::read_frame(&mut server).await {
        Err(PrexdError::Io(e)) => {
            assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof)
        }
        other => panic!("expected EOF error, got {:?}", other.map(|_| ())),
    }
}
