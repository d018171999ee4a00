//! Mock server against a fake client socket over loopback.

use std::time::Duration;

use tokio::net::UdpSocket;

use lwm2m_harness::assertions::{
    assert_demo_deregisters, assert_demo_registers, assert_demo_updates_registration, assert_no_message, Field,
    RegisterExpectation,
};
use lwm2m_harness::coap::{BlockOption, Code, ContentFormat, Token};
use lwm2m_harness::dm::{self, DmOptions, Payload};
use lwm2m_harness::link_format::Link;
use lwm2m_harness::messages::{Lwm2mMessage, MessageKind};
use lwm2m_harness::path::Lwm2mPath;
use lwm2m_harness::server::{MockServer, RegistrationState};
use lwm2m_harness::error::HarnessError;
use lwm2m_harness::senml::{SenmlRecord, SenmlValue};
use lwm2m_harness::time::Deadline;
use lwm2m_harness::transport::TransportConfig;
use lwm2m_harness::tlv::{self, Tlv};

const ENDPOINT: &str = "urn:dev:os:loopback";

async fn fake_client(server: &MockServer) -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.connect(server.local_addr()).await.unwrap();
    socket
}

async fn client_recv(client: &UdpSocket) -> Lwm2mMessage {
    let mut buf = vec![0u8; 4096];
    let len = tokio::time::timeout(Duration::from_secs(2), client.recv(&mut buf))
        .await
        .expect("no datagram for the fake client")
        .unwrap();
    Lwm2mMessage::decode(&buf[..len]).unwrap()
}

fn soon() -> Deadline {
    Deadline::after(Duration::from_secs(2))
}

/// Registers the fake client and returns it with the server.
async fn registered_pair() -> (MockServer, UdpSocket) {
    let mut server = MockServer::bind("server1", TransportConfig::plain()).await.unwrap();
    let client = fake_client(&server).await;
    let links = [Link::new("/1/1"), Link::new("/3/0")];
    let register = Lwm2mMessage::register(ENDPOINT, Some(86400), "1.1", &links).with_ids(1, Token::new(vec![1]).unwrap());
    client.send(&register.encode()).await.unwrap();

    let expectation = RegisterExpectation::default()
        .with_endpoint(ENDPOINT)
        .with_lifetime(Some(86400));
    assert_demo_registers(&mut server, &expectation, soon()).await.unwrap();
    let created = client_recv(&client).await;
    assert_eq!(created.code, Code::CREATED);
    assert_eq!(created.location_path(), "/rd/demo");
    (server, client)
}

#[tokio::test]
async fn registration_lifecycle() {
    let (mut server, client) = registered_pair().await;
    assert!(server.registration().is_registered());
    assert_eq!(server.registration().endpoint(), Some(ENDPOINT));

    let update = Lwm2mMessage::update("/rd/demo", Some(60), None).with_ids(2, Token::new(vec![2]).unwrap());
    client.send(&update.encode()).await.unwrap();
    assert_demo_updates_registration(&mut server, Field::Is(Some(60)), Code::CHANGED, soon())
        .await
        .unwrap();
    assert_eq!(client_recv(&client).await.code, Code::CHANGED);
    assert_eq!(server.registration().lifetime(), Some(60));

    let deregister = Lwm2mMessage::deregister("/rd/demo").with_ids(3, Token::new(vec![3]).unwrap());
    client.send(&deregister.encode()).await.unwrap();
    assert_demo_deregisters(&mut server, soon()).await.unwrap();
    assert_eq!(client_recv(&client).await.code, Code::DELETED);
    assert_eq!(server.registration().state(), RegistrationState::Unregistered);
    assert_no_message(&mut server, Duration::from_millis(200)).await.unwrap();
}

#[tokio::test]
async fn update_rejected_with_4xx_forces_reregister() {
    let (mut server, client) = registered_pair().await;
    let update = Lwm2mMessage::update("/rd/demo", None, None).with_ids(9, Token::new(vec![9]).unwrap());
    client.send(&update.encode()).await.unwrap();
    assert_demo_updates_registration(&mut server, Field::Any, Code::NOT_FOUND, soon())
        .await
        .unwrap();
    assert_eq!(client_recv(&client).await.code, Code::NOT_FOUND);
    assert_eq!(server.registration().state(), RegistrationState::Unregistered);
}

#[tokio::test]
async fn wrong_register_is_reported() {
    let mut server = MockServer::bind("server1", TransportConfig::plain()).await.unwrap();
    let client = fake_client(&server).await;
    let register = Lwm2mMessage::register("someone-else", Some(30), "1.1", &[]).with_ids(1, Token::empty());
    client.send(&register.encode()).await.unwrap();

    let err = assert_demo_registers(&mut server, &RegisterExpectation::default().with_endpoint(ENDPOINT), soon())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("endpoint"), "{err}");
}

#[tokio::test]
async fn dm_operations_against_fake_client() {
    let (mut server, client) = registered_pair().await;

    let responder = tokio::spawn(async move {
        let read = client_recv(&client).await;
        assert_eq!(read.kind(), MessageKind::Read);
        assert_eq!(read.uri_path(), "/3/0/0");
        let reply = Lwm2mMessage::content_matching(&read, Some(ContentFormat::TEXT), b"Demo".to_vec());
        client.send(&reply.encode()).await.unwrap();

        let write = client_recv(&client).await;
        assert_eq!(write.kind(), MessageKind::Write);
        let nodes = tlv::parse_all(&write.payload).unwrap();
        assert_eq!(nodes[0].as_int().unwrap(), 300);
        client
            .send(&Lwm2mMessage::changed_matching(&write).encode())
            .await
            .unwrap();

        let composite = client_recv(&client).await;
        assert_eq!(composite.kind(), MessageKind::ReadComposite);
        let records = vec![SenmlRecord::new("/3/0/9", SenmlValue::Integer(87))];
        let payload = lwm2m_harness::senml::encode_json(&records).unwrap();
        let reply = Lwm2mMessage::content_matching(&composite, Some(ContentFormat::SENML_JSON), payload);
        client.send(&reply.encode()).await.unwrap();

        let execute = client_recv(&client).await;
        assert_eq!(execute.kind(), MessageKind::Execute);
        let reply = Lwm2mMessage::error_matching(&execute, Code::METHOD_NOT_ALLOWED);
        client.send(&reply.encode()).await.unwrap();
    });

    let read = dm::read(&mut server, &Lwm2mPath::resource(3, 0, 0), DmOptions::new().with_accept(ContentFormat::TEXT))
        .await
        .unwrap();
    assert_eq!(read.payload.as_text(), Some("Demo"));

    dm::write_tlv(&mut server, &Lwm2mPath::instance(1, 1), &[Tlv::resource_int(1, 300)], DmOptions::new())
        .await
        .unwrap();

    let composite = dm::read_composite(&mut server, &[Lwm2mPath::resource(3, 0, 9)], DmOptions::new())
        .await
        .unwrap();
    let records = composite.payload.as_senml().unwrap();
    assert_eq!(records[0].value, Some(SenmlValue::Integer(87)));

    dm::execute(
        &mut server,
        &Lwm2mPath::resource(3, 0, 4),
        None,
        DmOptions::new().expecting(Code::METHOD_NOT_ALLOWED),
    )
    .await
    .unwrap();

    responder.await.unwrap();
}

/// Answers sequential Block2 reads of the bytes resource with `data` until the
/// last block has been served.
async fn serve_bytes_resource(client: UdpSocket, data: Vec<u8>) -> (UdpSocket, usize) {
    let mut served = 0;
    loop {
        let read = client_recv(&client).await;
        assert_eq!(read.kind(), MessageKind::Read);
        assert_eq!(read.uri_path(), "/19/0/0");
        let block = read.block2().unwrap().expect("read without Block2");
        assert_eq!(block.seq_num as usize, served);

        let offset = block.offset();
        let end = (offset + usize::from(block.size)).min(data.len());
        let more = end < data.len();
        let reply = Lwm2mMessage::content_matching(&read, Some(ContentFormat::OPAQUE), data[offset..end].to_vec())
            .into_message()
            .with_block2(BlockOption::new(block.seq_num, more, usize::from(block.size)).unwrap());
        client.send(&reply.encode()).await.unwrap();
        served += 1;
        if !more {
            return (client, served);
        }
    }
}

#[tokio::test]
async fn read_blockwise_reassembles_bytes_resource() {
    let (mut server, mut client) = registered_pair().await;
    const BLOCK_SIZES: &[usize] = &[16, 32, 64, 128, 256, 512, 1024];
    let path = Lwm2mPath::resource(19, 0, 0);

    for &block_size in BLOCK_SIZES {
        for len in [1usize, 9001] {
            let data: Vec<u8> = (0..len).map(|i| (i % 253) as u8).collect();
            let responder = tokio::spawn(serve_bytes_resource(client, data.clone()));
            let response = dm::read_blockwise(&mut server, &path, block_size, DmOptions::new())
                .await
                .unwrap();
            let (returned, blocks) = responder.await.unwrap();
            client = returned;

            assert_eq!(response.payload, Payload::Opaque(data), "block size {block_size}, length {len}");
            assert_eq!(blocks, len.div_ceil(block_size));
        }
    }
}

#[tokio::test]
async fn senml_read_outside_requested_path_fails() {
    let (mut server, client) = registered_pair().await;

    let responder = tokio::spawn(async move {
        let read = client_recv(&client).await;
        assert_eq!(read.uri_path(), "/3/0/9");
        let records = vec![SenmlRecord::new("/3/0/10", SenmlValue::Integer(1024))];
        let payload = lwm2m_harness::senml::encode_json(&records).unwrap();
        let reply = Lwm2mMessage::content_matching(&read, Some(ContentFormat::SENML_JSON), payload);
        client.send(&reply.encode()).await.unwrap();
    });

    let err = dm::read(
        &mut server,
        &Lwm2mPath::resource(3, 0, 9),
        DmOptions::new().with_accept(ContentFormat::SENML_JSON),
    )
    .await
    .unwrap_err();
    match err {
        HarnessError::Assertion(message) => {
            assert!(message.contains("/3/0/10"), "{message}");
            assert!(message.contains(&hex::encode("/3/0/10")), "{message}");
        }
        other => panic!("unexpected error {other}"),
    }
    responder.await.unwrap();
}
