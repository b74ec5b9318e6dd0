//! End-to-end tests driving a server connection and a client connection
//! over an in-process byte stream.

use {
    async_trait::async_trait,
    std::time::Duration,
    styx::{
        Data, FCall, Msg, NOFID, NOTAG, QId, QIdType, Result, Stat, errstr,
        client::{Client, ClientConfig},
        serialize::{decode_msg, encode_msg},
        srv::{ConnInfo, Connection, Handler, ServerConfig, accept},
    },
    tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream},
};

#[derive(Clone)]
struct TestFs;

#[async_trait]
impl Handler for TestFs {
    async fn rpc(&self, _info: &ConnInfo, req: FCall) -> Result<FCall> {
        match req {
            FCall::TRead { offset, count, .. } => {
                if offset == u64::MAX {
                    // Parked forever; only a flush gets rid of it.
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                // Stagger completions so responses come back out of order.
                tokio::time::sleep(Duration::from_millis(offset % 17)).await;
                let len = count.min(8) as usize;
                Ok(FCall::RRead {
                    data: Data(vec![offset as u8; len]),
                })
            }
            FCall::TWalk { ref wnames, .. } => Ok(FCall::RWalk {
                wqids: (0..wnames.len())
                    .map(|i| QId {
                        typ: QIdType::DIR,
                        version: 0,
                        path: i as u64 + 1,
                    })
                    .collect(),
            }),
            FCall::TOpen { .. } => Ok(FCall::ROpen {
                qid: QId::default(),
                iounit: 0,
            }),
            FCall::TClunk { .. } => Ok(FCall::RClunk),
            FCall::TStat { .. } => Ok(FCall::RStat {
                stat: Stat {
                    name: "x".to_owned(),
                    uid: "test".to_owned(),
                    gid: "test".to_owned(),
                    muid: "test".to_owned(),
                    ..Default::default()
                },
            }),
            _ => Err(errstr::EINVAL.into()),
        }
    }
}

fn spawn_server(stream: DuplexStream, msize: u32) -> tokio::task::JoinHandle<Result<()>> {
    tokio::spawn(async move {
        let (reader, writer) = tokio::io::split(stream);
        accept(TestFs, reader, writer, ServerConfig { msize })
            .await?
            .join()
            .await
    })
}

async fn send_frame(stream: &mut DuplexStream, msg: &Msg) {
    let bytes = encode_msg(msg).unwrap();
    stream.write_all(&bytes).await.unwrap();
}

async fn recv_frame(stream: &mut DuplexStream) -> Vec<u8> {
    let mut size = [0u8; 4];
    stream.read_exact(&mut size).await.unwrap();

    let total = u32::from_le_bytes(size) as usize;
    let mut frame = size.to_vec();
    frame.resize(total, 0);
    stream.read_exact(&mut frame[4..]).await.unwrap();
    frame
}

async fn recv_body(stream: &mut DuplexStream) -> Msg {
    let frame = recv_frame(stream).await;
    decode_msg(&frame).unwrap().0
}

async fn expect_eof(stream: &mut DuplexStream) {
    let mut buf = [0u8; 1];
    assert_eq!(stream.read(&mut buf).await.unwrap(), 0, "expected EOF");
}

fn tversion(msize: u32, version: &str) -> Msg {
    Msg {
        tag: NOTAG,
        body: FCall::TVersion {
            msize,
            version: version.to_owned(),
        },
    }
}

fn tattach(tag: u16) -> Msg {
    Msg {
        tag,
        body: FCall::TAttach {
            fid: 0,
            afid: NOFID,
            uname: "anon".to_owned(),
            aname: String::new(),
        },
    }
}

async fn raw_handshake(stream: &mut DuplexStream) {
    send_frame(stream, &tversion(8192, "9P2000")).await;
    let msg = recv_body(stream).await;
    assert!(matches!(msg.body, FCall::RVersion { .. }));

    send_frame(stream, &tattach(1)).await;
    let msg = recv_body(stream).await;
    assert!(matches!(msg.body, FCall::RAttach { .. }));
}

#[tokio::test]
async fn version_negotiation_wire_trace() {
    let (mut client, server) = tokio::io::duplex(65536);
    let _server = spawn_server(server, 4096);

    send_frame(&mut client, &tversion(8192, "9P2000")).await;

    // size=19 type=101 tag=0xffff msize=4096 version="9P2000"
    let expected = [
        0x13, 0x00, 0x00, 0x00, 0x65, 0xff, 0xff, 0x00, 0x10, 0x00, 0x00, 0x06, 0x00, b'9', b'P',
        b'2', b'0', b'0', b'0',
    ];
    assert_eq!(recv_frame(&mut client).await, expected);
}

#[tokio::test]
async fn attach_returns_root_qid_wire_trace() {
    let (mut client, server) = tokio::io::duplex(65536);
    let _server = spawn_server(server, 4096);

    send_frame(&mut client, &tversion(8192, "9P2000")).await;
    recv_frame(&mut client).await;

    send_frame(&mut client, &tattach(1)).await;

    // size=20 type=105 tag=1 qid={type=0x80, version=0, path=0}
    let expected = [
        0x14, 0x00, 0x00, 0x00, 0x69, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00,
    ];
    assert_eq!(recv_frame(&mut client).await, expected);
}

#[tokio::test]
async fn unknown_version_is_rejected() {
    let (mut client, server) = tokio::io::duplex(65536);
    let _server = spawn_server(server, 4096);

    send_frame(&mut client, &tversion(8192, "unknown-proto")).await;

    let msg = recv_body(&mut client).await;
    assert_eq!(msg.tag, NOTAG);
    assert_eq!(
        msg.body,
        FCall::RVersion {
            msize: 4096,
            version: "unknown".to_owned(),
        }
    );
    expect_eof(&mut client).await;
}

#[tokio::test]
async fn request_before_attach_is_a_violation() {
    let (mut client, server) = tokio::io::duplex(65536);
    let _server = spawn_server(server, 4096);

    send_frame(&mut client, &tversion(8192, "9P2000")).await;
    recv_frame(&mut client).await;

    send_frame(
        &mut client,
        &Msg {
            tag: 1,
            body: FCall::TRead {
                fid: 0,
                offset: 0,
                count: 64,
            },
        },
    )
    .await;

    let msg = recv_body(&mut client).await;
    assert_eq!(msg.tag, 1);
    assert!(matches!(msg.body, FCall::RError { .. }));
    expect_eof(&mut client).await;
}

#[tokio::test]
async fn malformed_body_gets_rerror_and_connection_survives() {
    let (mut client, server) = tokio::io::duplex(65536);
    let _server = spawn_server(server, 4096);
    raw_handshake(&mut client).await;

    // A 20-byte Twalk at tag 42 whose body breaks off inside a name.
    let mut frame = vec![20, 0, 0, 0, 110, 42, 0];
    frame.extend_from_slice(&0u32.to_le_bytes());
    frame.extend_from_slice(&1u32.to_le_bytes());
    frame.extend_from_slice(&2u16.to_le_bytes());
    frame.extend_from_slice(&[5, 0, b'a']);
    assert_eq!(frame.len(), 20);
    client.write_all(&frame).await.unwrap();

    let msg = recv_body(&mut client).await;
    assert_eq!(msg.tag, 42);
    assert!(matches!(msg.body, FCall::RError { .. }));

    // Still connected: a well-formed request is served.
    send_frame(
        &mut client,
        &Msg {
            tag: 2,
            body: FCall::TClunk { fid: 0 },
        },
    )
    .await;
    let msg = recv_body(&mut client).await;
    assert_eq!(msg.tag, 2);
    assert_eq!(msg.body, FCall::RClunk);
}

#[tokio::test]
async fn oversize_frame_disconnects_without_response() {
    let (mut client, server) = tokio::io::duplex(65536);
    let _server = spawn_server(server, 4096);
    raw_handshake(&mut client).await;

    client.write_all(&4097u32.to_le_bytes()).await.unwrap();
    client.write_all(&[0u8; 32]).await.unwrap();

    expect_eof(&mut client).await;
}

#[tokio::test]
async fn duplicate_tag_is_refused() {
    let (mut client, server) = tokio::io::duplex(65536);
    let _server = spawn_server(server, 4096);
    raw_handshake(&mut client).await;

    // Park a request on tag 3, then reuse the tag while it is in flight.
    let parked = Msg {
        tag: 3,
        body: FCall::TRead {
            fid: 0,
            offset: u64::MAX,
            count: 8,
        },
    };
    send_frame(&mut client, &parked).await;
    send_frame(&mut client, &parked).await;

    let msg = recv_body(&mut client).await;
    assert_eq!(msg.tag, 3);
    assert_eq!(
        msg.body,
        FCall::RError {
            ename: errstr::EDUPTAG.to_owned(),
        }
    );
}

#[tokio::test]
async fn client_handshake_and_file_ops() {
    let (client_stream, server) = tokio::io::duplex(65536);
    let _server = spawn_server(server, 4096);

    let client = Client::connect(client_stream, ClientConfig::default())
        .await
        .unwrap();
    assert_eq!(client.info().msize, 4096);
    assert_eq!(client.root_qid().typ, QIdType::DIR);

    let (fid, wqids) = client.walk(client.root(), &["usr", "glenda"]).await.unwrap();
    assert_eq!(wqids.len(), 2);

    let (qid, _) = client.open(fid, styx::om::READ).await.unwrap();
    assert_eq!(qid, QId::default());

    let data = client.read(fid, 1, 8).await.unwrap();
    assert_eq!(data, vec![1u8; 8]);

    client.clunk(fid).await.unwrap();
}

#[tokio::test]
async fn fifty_concurrent_calls_resolve_distinctly() {
    let (client_stream, server) = tokio::io::duplex(65536);
    let _server = spawn_server(server, 4096);

    let client = Client::connect(client_stream, ClientConfig::default())
        .await
        .unwrap();

    let calls = (0..50u64).map(|offset| {
        let client = client.clone();
        async move {
            let resp = client
                .call(FCall::TRead {
                    fid: 0,
                    offset,
                    count: 8,
                })
                .await
                .unwrap();
            // Correlation proof: each response carries its request's offset.
            assert_eq!(
                resp,
                FCall::RRead {
                    data: Data(vec![offset as u8; 8]),
                }
            );
        }
    });
    futures::future::join_all(calls).await;
}

#[tokio::test]
async fn hundred_staggered_handlers_all_answer() {
    let (client_stream, server) = tokio::io::duplex(65536);
    let _server = spawn_server(server, 4096);

    let client = Client::connect(client_stream, ClientConfig::default())
        .await
        .unwrap();

    let calls = (0..100u64).map(|i| {
        let client = client.clone();
        // Spread the sleep durations so completion order scrambles.
        let offset = (i * 7) % 17;
        async move {
            let resp = client
                .call(FCall::TRead {
                    fid: 0,
                    offset,
                    count: 4,
                })
                .await
                .unwrap();
            assert_eq!(
                resp,
                FCall::RRead {
                    data: Data(vec![offset as u8; 4]),
                }
            );
        }
    });
    futures::future::join_all(calls).await;
}

#[tokio::test]
async fn flush_frees_the_old_tag_on_the_wire() {
    let (mut client, server) = tokio::io::duplex(65536);
    let _server = spawn_server(server, 4096);
    raw_handshake(&mut client).await;

    // Park tag 7, flush it from tag 8.
    send_frame(
        &mut client,
        &Msg {
            tag: 7,
            body: FCall::TRead {
                fid: 0,
                offset: u64::MAX,
                count: 8,
            },
        },
    )
    .await;
    send_frame(
        &mut client,
        &Msg {
            tag: 8,
            body: FCall::TFlush { oldtag: 7 },
        },
    )
    .await;

    let msg = recv_body(&mut client).await;
    assert_eq!(msg.tag, 8);
    assert_eq!(msg.body, FCall::RFlush);

    // After the Rflush, tag 7 is reusable and the flushed request never
    // answers.
    send_frame(
        &mut client,
        &Msg {
            tag: 7,
            body: FCall::TClunk { fid: 0 },
        },
    )
    .await;
    let msg = recv_body(&mut client).await;
    assert_eq!(msg.tag, 7);
    assert_eq!(msg.body, FCall::RClunk);
}

#[tokio::test]
async fn flush_cancels_a_parked_call() {
    let (client_stream, server) = tokio::io::duplex(65536);
    let _server = spawn_server(server, 4096);

    let client = Client::connect(client_stream, ClientConfig::default())
        .await
        .unwrap();

    let call = client
        .send(FCall::TRead {
            fid: 0,
            offset: u64::MAX,
            count: 8,
        })
        .await
        .unwrap();

    call.cancel().await.unwrap();

    // The connection is unaffected and new transactions go through.
    let resp = client.call(FCall::TClunk { fid: 0 }).await.unwrap();
    assert_eq!(resp, FCall::RClunk);
}

#[tokio::test]
async fn rerror_resolves_as_ename() {
    let (client_stream, server) = tokio::io::duplex(65536);
    let _server = spawn_server(server, 4096);

    let client = Client::connect(client_stream, ClientConfig::default())
        .await
        .unwrap();

    let err = client
        .call(FCall::TRemove { fid: 0 })
        .await
        .expect_err("TestFs refuses Tremove");
    assert_eq!(err.to_string(), errstr::EINVAL);
}

#[tokio::test]
async fn disconnect_tears_the_stream_down() {
    let (mut client, server) = tokio::io::duplex(65536);
    let handle: tokio::task::JoinHandle<Result<Connection>> = tokio::spawn(async move {
        let (reader, writer) = tokio::io::split(server);
        accept(TestFs, reader, writer, ServerConfig { msize: 4096 }).await
    });

    raw_handshake(&mut client).await;

    let conn = handle.await.unwrap().unwrap();
    assert_eq!(conn.info().msize, 4096);
    conn.disconnect().await.unwrap();

    expect_eof(&mut client).await;
}
