use std::{env, process::exit};

use futures_util::StreamExt;
use tchap_sdk::{config::SyncSettings, timeline::TimelineItem, Client, MatrixSession};

fn describe(item: &TimelineItem) -> String {
    let body = item
        .content()
        .as_message()
        .map(|message| message.body.clone())
        .unwrap_or_else(|| format!("<{}>", item.event_type()));

    match item.send_state() {
        Some(state) if item.is_local_echo() => format!("{}: {body} ({state:?})", item.sender()),
        _ => format!("{}: {body}", item.sender()),
    }
}

async fn tail(client: Client, room_id: &str) -> anyhow::Result<()> {
    // Wait for the first sync to know about the room.
    client.sync_once(SyncSettings::default()).await?;

    let Some(room) = client.get_room(room_id.try_into()?).await? else {
        anyhow::bail!("the room {room_id} is unknown to this account");
    };

    println!("Following {}", room.display_name().await?);

    let sync_client = client.clone();
    tokio::spawn(async move {
        if let Err(error) = sync_client.sync(SyncSettings::default()).await {
            eprintln!("The sync loop stopped: {error}");
        }
    });

    let timeline = room.timeline().await?;
    let (items, mut stream) = timeline.subscribe().await;

    for item in &items {
        println!("{}", describe(item));
    }

    while let Some(diff) = stream.next().await {
        println!("{diff:?}");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let (Some(homeserver_url), Some(user_id), Some(device_id), Some(access_token), Some(room_id)) = (
        env::args().nth(1),
        env::args().nth(2),
        env::args().nth(3),
        env::args().nth(4),
        env::args().nth(5),
    ) else {
        eprintln!(
            "Usage: {} <homeserver_url> <user_id> <device_id> <access_token> <room_id>",
            env::args().next().unwrap()
        );
        exit(1)
    };

    let client = Client::builder().homeserver_url(homeserver_url).build().await?;
    client
        .restore_session(MatrixSession {
            user_id: user_id.try_into()?,
            device_id: device_id.as_str().into(),
            access_token,
        })
        .await?;

    tail(client, &room_id).await
}
