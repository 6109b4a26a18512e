// Copyright 2025-Present Tracekit contributors.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end coverage of the method-invocation layer over a socketpair:
//! bind, unary invoke, streaming replies, handler-dropped reply sinks, and
//! disconnect fan-out.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::net::UnixStream;
use tokio::runtime;
use tokio::sync::mpsc;

use tracekit_ipc::service::{decode_as, encode_msg, reply_deferred};
use tracekit_ipc::{
    AsyncResult, Client, ClientInfo, Deferred, Host, IpcService, MethodDescriptor,
    ProxyEventListener, ServiceDescriptor, ServiceProxy,
};

#[derive(Serialize, Deserialize)]
struct EchoArgs {
    text: String,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct EchoReply {
    text: String,
}

#[derive(Serialize, Deserialize)]
struct CountArgs {
    upto: u32,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct CountReply {
    num: u32,
}

static TEST_SERVICE: ServiceDescriptor = ServiceDescriptor {
    service_name: "TestService",
    methods: &[
        MethodDescriptor {
            name: "Echo",
            decode_reply: decode_as::<EchoReply>,
        },
        MethodDescriptor {
            name: "Count",
            decode_reply: decode_as::<CountReply>,
        },
        MethodDescriptor {
            name: "Nack",
            decode_reply: decode_as::<EchoReply>,
        },
        MethodDescriptor {
            name: "Hold",
            decode_reply: decode_as::<EchoReply>,
        },
    ],
};

#[derive(Default)]
struct TestService {
    held: Option<Deferred<Vec<u8>>>,
}

impl IpcService for TestService {
    fn descriptor(&self) -> &'static ServiceDescriptor {
        &TEST_SERVICE
    }

    fn on_invoke(
        &mut self,
        method_id: u32,
        args: &[u8],
        _client: &ClientInfo,
        mut reply: Deferred<Vec<u8>>,
    ) {
        match method_id {
            1 => {
                let args: EchoArgs = bincode::deserialize(args).unwrap();
                let msg = encode_msg(&EchoReply {
                    text: args.text.to_uppercase(),
                })
                .unwrap();
                reply.resolve(AsyncResult::new(msg));
            }
            2 => {
                let args: CountArgs = bincode::deserialize(args).unwrap();
                for num in 0..args.upto {
                    let msg = encode_msg(&CountReply { num }).unwrap();
                    reply.resolve(AsyncResult::new(msg).with_has_more(num + 1 < args.upto));
                }
            }
            3 => drop(reply),
            4 => self.held = Some(reply),
            other => panic!("unexpected method id {other}"),
        }
    }

    fn on_client_disconnected(&mut self, _client: &ClientInfo) {
        // Dropping a held sink produces the final failure reply.
        self.held = None;
    }
}

struct Listener {
    events: mpsc::UnboundedSender<String>,
}

impl ProxyEventListener for Listener {
    fn on_connect(&mut self, success: bool) {
        self.events.send(format!("connect:{success}")).unwrap();
    }

    fn on_disconnect(&mut self) {
        self.events.send("disconnect".to_string()).unwrap();
    }
}

fn new_proxy(events: mpsc::UnboundedSender<String>) -> Arc<Mutex<ServiceProxy>> {
    Arc::new(Mutex::new(ServiceProxy::new(
        &TEST_SERVICE,
        Box::new(Listener { events }),
    )))
}

#[test]
fn bind_invoke_stream_and_disconnect() {
    let rt = runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    rt.block_on(async {
        let (client_stream, host_stream) = UnixStream::pair().unwrap();
        let host = Host::new();
        host.expose_service(Box::<TestService>::default());
        let server = host.clone();
        tokio::spawn(async move { server.serve_connection(host_stream).await });

        let client = Client::from_stream(client_stream);
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let proxy = new_proxy(events_tx);

        client.bind_service(&proxy);
        assert_eq!("connect:true", events.recv().await.unwrap());
        assert!(proxy.lock().unwrap().connected());

        // Unary invocation round trip.
        let (reply_tx, mut replies) = mpsc::unbounded_channel();
        let request_id = client.invoke_method(
            &proxy,
            "Echo",
            &EchoArgs {
                text: "hello".to_string(),
            },
            reply_deferred::<EchoReply, _>(move |result| {
                reply_tx
                    .send((result.has_more(), result.into_msg()))
                    .unwrap();
            }),
        );
        assert_ne!(0, request_id);
        let (has_more, msg) = replies.recv().await.unwrap();
        assert!(!has_more);
        assert_eq!(
            Some(EchoReply {
                text: "HELLO".to_string()
            }),
            msg
        );

        // Streaming replies arrive in order and terminate the slot.
        let (reply_tx, mut replies) = mpsc::unbounded_channel();
        let request_id = client.invoke_method(
            &proxy,
            "Count",
            &CountArgs { upto: 4 },
            reply_deferred::<CountReply, _>(move |result| {
                reply_tx
                    .send((result.has_more(), result.into_msg()))
                    .unwrap();
            }),
        );
        assert_ne!(0, request_id);
        for num in 0..4u32 {
            let (has_more, msg) = replies.recv().await.unwrap();
            assert_eq!(num < 3, has_more);
            assert_eq!(Some(CountReply { num }), msg);
        }

        // A handler that drops its sink still produces one failure reply.
        let (reply_tx, mut replies) = mpsc::unbounded_channel();
        client.invoke_method(
            &proxy,
            "Nack",
            &EchoArgs {
                text: String::new(),
            },
            reply_deferred::<EchoReply, _>(move |result| {
                reply_tx.send(result.success()).unwrap();
            }),
        );
        assert!(!replies.recv().await.unwrap());

        // Leave one request in flight, then drop the connection: the pending
        // reply is rejected and the proxy hears on_disconnect.
        let (reply_tx, mut replies) = mpsc::unbounded_channel();
        let request_id = client.invoke_method(
            &proxy,
            "Hold",
            &EchoArgs {
                text: String::new(),
            },
            reply_deferred::<EchoReply, _>(move |result| {
                reply_tx.send(result.success()).unwrap();
            }),
        );
        assert_ne!(0, request_id);
        client.close();
        assert!(!replies.recv().await.unwrap());
        assert_eq!("disconnect", events.recv().await.unwrap());
        assert!(!proxy.lock().unwrap().connected());
    });
}

#[test]
fn binding_an_unknown_service_fails() {
    static NO_SUCH_SERVICE: ServiceDescriptor = ServiceDescriptor {
        service_name: "NoSuchService",
        methods: &[MethodDescriptor {
            name: "Nop",
            decode_reply: decode_as::<EchoReply>,
        }],
    };

    let rt = runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    rt.block_on(async {
        let (client_stream, host_stream) = UnixStream::pair().unwrap();
        let host = Host::new();
        host.expose_service(Box::<TestService>::default());
        let server = host.clone();
        tokio::spawn(async move { server.serve_connection(host_stream).await });

        let client = Client::from_stream(client_stream);
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let proxy = Arc::new(Mutex::new(ServiceProxy::new(
            &NO_SUCH_SERVICE,
            Box::new(Listener { events: events_tx }),
        )));
        client.bind_service(&proxy);
        assert_eq!("connect:false", events.recv().await.unwrap());
    });
}

#[test]
fn invoking_before_bind_fails_synchronously() {
    let rt = runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    rt.block_on(async {
        let (client_stream, _host_stream) = UnixStream::pair().unwrap();
        let client = Client::from_stream(client_stream);
        let (events_tx, _events) = mpsc::unbounded_channel();
        let proxy = new_proxy(events_tx);

        let (reply_tx, mut replies) = mpsc::unbounded_channel();
        let request_id = client.invoke_method(
            &proxy,
            "Echo",
            &EchoArgs {
                text: String::new(),
            },
            reply_deferred::<EchoReply, _>(move |result| {
                reply_tx.send(result.success()).unwrap();
            }),
        );
        assert_eq!(0, request_id);
        // The dropped slot delivered its failure before invoke returned.
        assert!(!replies.try_recv().unwrap());
    });
}
