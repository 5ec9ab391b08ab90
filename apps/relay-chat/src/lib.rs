//! Chat backend for one relay channel.
//!
//! `postMessage` is stamped with the sender and re-emitted to the channel as
//! `chatMessage`; `ping` acknowledges with `"pong"`; `join` and `leave`
//! manage room membership.

use relay_backend::{Namespace, Next, VirtualSession};
use serde_json::{json, Value};
use tracing::{debug, info};

pub const DEFAULT_CHANNEL: &str = "/chat";

pub fn install(namespace: &Namespace) {
    namespace.use_middleware(|session: VirtualSession| async move {
        debug!(
            socket_id = %session.id(),
            user = ?session.get("username"),
            "chat session connecting"
        );
        Next::Continue
    });

    namespace.on_connection(|session: VirtualSession| async move {
        register_handlers(&session);
        info!(socket_id = %session.id(), channel = %session.channel(), "chat session joined");
        Ok(())
    });
}

fn register_handlers(session: &VirtualSession) {
    let sender = session.clone();
    session.on("postMessage", move |args: Vec<Value>, _ack| {
        let session = sender.clone();
        async move {
            let Some(Value::Object(mut message)) = args.into_iter().next() else {
                return Err("postMessage expects an object".into());
            };
            message.insert("sender".into(), json!(session.id()));
            session
                .to_channel()
                .emit("chatMessage", vec![Value::Object(message)])
                .await?;
            Ok(())
        }
    });

    session.on("ping", |_args: Vec<Value>, ack| async move {
        if let Some(ack) = ack {
            ack.send(vec![json!("pong")]).await?;
        }
        Ok(())
    });

    let member = session.clone();
    session.on("join", move |args: Vec<Value>, ack| {
        let session = member.clone();
        async move {
            let room = room_arg(&args)?;
            session.join(&room).await?;
            if let Some(ack) = ack {
                ack.send(vec![json!(room)]).await?;
            }
            Ok(())
        }
    });

    let member = session.clone();
    session.on("leave", move |args: Vec<Value>, _ack| {
        let session = member.clone();
        async move {
            let room = room_arg(&args)?;
            session.leave(&room).await?;
            Ok(())
        }
    });

    let leaving = session.id().to_string();
    session.on("disconnect", move |_args: Vec<Value>, _ack| {
        let socket_id = leaving.clone();
        async move {
            info!(%socket_id, "chat session left");
            Ok(())
        }
    });
}

fn room_arg(args: &[Value]) -> Result<String, relay_backend::HandlerError> {
    match args.first() {
        Some(Value::String(room)) if !room.is_empty() => Ok(room.clone()),
        _ => Err("expected a room name".into()),
    }
}
