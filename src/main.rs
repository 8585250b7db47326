use anyhow::{anyhow, Context, Result};
use chat_receipts::chat_list::{build_entries, EntryTarget};
use chat_receipts::chats::ChatService;
use chat_receipts::config::Config;
use chat_receipts::error::StoreResult;
use chat_receipts::identity::Session;
use chat_receipts::media::LocalMediaHost;
use chat_receipts::models::{Attachment, AttachmentKind, Message, MessageDraft, User, Visibility};
use chat_receipts::receipts::{ReceiptReconciler, ReceiptWatcher};
use chat_receipts::status::StatusService;
use chat_receipts::storage::Storage;
use chat_receipts::store::{ConversationStore, IdentityProvider, MediaHost, MessageStore, UserStore};
use chrono::{Local, Utc};
use dotenv::dotenv;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use uuid::Uuid;

const HELP: &str = "Commands:
  register <name> [email]         create a user
  login <name> | logout
  users | chats
  open <name>                     open the chat with a user or a group
  group <name> <user> [user...]   create a group chat
  send <text>                     send to the open chat
  photo <path>                    send an image to the open chat
  status <path> [caption]         post a status for 24 hours
  statuses                        list your active statuses
  view <name>                     view someone's active statuses
  close | help | exit";

struct OpenChat {
    chat_id: Uuid,
    watcher: ReceiptWatcher,
    feed: JoinHandle<()>,
}

struct App {
    config: Config,
    storage: Storage,
    session: Session,
    media: Arc<LocalMediaHost>,
    chats: ChatService,
    statuses: StatusService,
    reconciler: Arc<ReceiptReconciler>,
    open: Option<OpenChat>,
}

impl App {
    fn new(config: Config) -> Result<Self> {
        let storage = Storage::new(&config.database_url)
            .with_context(|| format!("Opening database {}", config.database_url))?;
        let shared = Arc::new(storage.clone());
        let media = Arc::new(LocalMediaHost::new(
            config.media_dir.clone(),
            config.media_base_url.clone(),
        ));

        Ok(App {
            chats: ChatService::new(shared.clone(), shared.clone(), config.chat_id_strategy),
            statuses: StatusService::new(shared.clone(), media.clone(), config.status_ttl),
            reconciler: Arc::new(ReceiptReconciler::new(shared.clone(), shared)),
            media,
            session: Session::new(),
            storage,
            config,
            open: None,
        })
    }

    async fn handle(&mut self, input: &str) -> Result<()> {
        let parts: Vec<&str> = input.split_whitespace().collect();
        let rest = |n: usize| parts.get(n..).map(|p| p.join(" ")).unwrap_or_default();

        match parts.first().map(|c| c.to_lowercase()).as_deref() {
            Some("help") => println!("{HELP}"),
            Some("register") if parts.len() >= 2 => {
                let name = parts[1];
                let email = parts
                    .get(2)
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| format!("{name}@localhost"));
                let user = User::new(name, email);
                self.storage.upsert(&user).await?;
                println!("Registered {name} ({})", user.id);
            }
            Some("login") if parts.len() >= 2 => {
                self.close().await;
                let user = self.user_named(parts[1]).await?;
                self.session.sign_in(&self.storage, user.id).await?;
                println!("Logged in as {}", user.name);
            }
            Some("logout") => {
                self.close().await;
                self.session.sign_out(&self.storage).await?;
                println!("Logged out");
            }
            Some("users") => {
                for user in self.storage.list().await? {
                    let presence = if user.is_online { "online" } else { "offline" };
                    println!("  {} ({presence})", user.name);
                }
            }
            Some("chats") => self.print_chats().await?,
            Some("open") if parts.len() >= 2 => self.open_chat(&rest(1)).await?,
            Some("group") if parts.len() >= 3 => {
                let me = self.session.require_user()?;
                let mut members = Vec::new();
                for name in &parts[2..] {
                    members.push(self.user_named(name).await?.id);
                }
                let chat_id = self.chats.create_group_chat(me, parts[1], &members).await?;
                println!("Group {} created ({chat_id})", parts[1]);
            }
            Some("send") if parts.len() >= 2 => {
                let chat_id = self.open_chat_id()?;
                self.chats
                    .send_current(&self.session, chat_id, MessageDraft::text(rest(1)))
                    .await?;
            }
            Some("photo") if parts.len() >= 2 => {
                let chat_id = self.open_chat_id()?;
                let bytes = tokio::fs::read(parts[1])
                    .await
                    .with_context(|| format!("Reading {}", parts[1]))?;
                let report = |p: f32| log::debug!("Upload {p:.0}%");
                let uploaded = self.media.upload(&bytes, Some(&report)).await?;
                let attachment = Attachment {
                    thumbnail_url: Some(self.media.thumbnail_url(&uploaded)),
                    id: uploaded.id,
                    url: uploaded.url,
                    kind: AttachmentKind::Image,
                    size: Some(uploaded.size),
                };
                self.chats
                    .send_current(&self.session, chat_id, MessageDraft::attachment(attachment))
                    .await?;
                println!("Image sent!");
            }
            Some("status") if parts.len() >= 2 => {
                let me = self.session.require_user()?;
                let bytes = tokio::fs::read(parts[1])
                    .await
                    .with_context(|| format!("Reading {}", parts[1]))?;
                let item = self
                    .statuses
                    .post(me, &bytes, &rest(2), Visibility::Everyone, None)
                    .await?;
                println!(
                    "Status shared until {}",
                    item.expires_at.with_timezone(&Local).format("%H:%M %d.%m")
                );
            }
            Some("statuses") => {
                let me = self.session.require_user()?;
                let now = Utc::now();
                self.statuses.purge_expired(now).await?;
                for item in self.statuses.active_for(me, now).await? {
                    println!(
                        "  {} \"{}\" viewed by {} (expires {})",
                        item.media_url,
                        item.caption,
                        item.viewers.len(),
                        item.expires_at.with_timezone(&Local).format("%H:%M")
                    );
                }
            }
            Some("view") if parts.len() >= 2 => {
                let me = self.session.require_user()?;
                let owner = self.user_named(parts[1]).await?;
                let items = self.statuses.active_for(owner.id, Utc::now()).await?;
                if items.is_empty() {
                    println!("{} has no active statuses", owner.name);
                }
                for item in &items {
                    println!("  {} \"{}\"", item.media_url, item.caption);
                    self.statuses.mark_viewed(item, me).await?;
                }
            }
            Some("close") => self.close().await,
            _ => println!("Unknown command, type 'help'"),
        }
        Ok(())
    }

    async fn user_named(&self, name: &str) -> Result<User> {
        self.storage
            .find_by_name(name)
            .await?
            .ok_or_else(|| anyhow!("User {name} not found"))
    }

    fn open_chat_id(&self) -> Result<Uuid> {
        self.open
            .as_ref()
            .map(|open| open.chat_id)
            .ok_or_else(|| anyhow!("Open a chat first"))
    }

    async fn print_chats(&self) -> Result<()> {
        let me = self.session.require_user()?;
        let chats = self.storage.list_for_member(me).await?;
        let users = self.storage.list().await?;

        for entry in build_entries(me, &chats, &users) {
            let online = if entry.is_online == Some(true) { " ●" } else { "" };
            match entry.target {
                EntryTarget::Chat(_) => {
                    let unread = if entry.unread_count > 0 {
                        format!(" [{}]", entry.unread_count)
                    } else {
                        String::new()
                    };
                    let when = entry
                        .last_message_at
                        .map(|at| at.with_timezone(&Local).format(" %H:%M").to_string())
                        .unwrap_or_default();
                    println!("  {}{online}{unread}{when}: {}", entry.name, entry.last_message);
                }
                EntryTarget::User(_) => {
                    println!("  {}{online} - {}", entry.name, entry.last_message);
                }
            }
        }
        Ok(())
    }

    async fn open_chat(&mut self, name: &str) -> Result<()> {
        let me = self.session.require_user()?;
        let group = self
            .storage
            .list_for_member(me)
            .await?
            .into_iter()
            .find(|chat| chat.is_group && chat.name.as_deref() == Some(name));
        let chat_id = match group {
            Some(chat) => chat.id,
            None => {
                let other = self.user_named(name).await?;
                self.chats.get_or_create_chat(me, other.id).await?
            }
        };

        self.close().await;

        let chat = ConversationStore::get(&self.storage, chat_id)
            .await?
            .ok_or_else(|| anyhow!("Chat {chat_id} disappeared"))?;
        let mut names = HashMap::new();
        for member in &chat.members {
            if let Some(user) = UserStore::get(&self.storage, *member).await? {
                names.insert(*member, user.name);
            }
        }

        let watcher = ReceiptWatcher::start(
            self.reconciler.clone(),
            &self.session,
            chat_id,
            self.config.receipt_poll_interval,
        )?;
        let feed = tokio::spawn(print_feed(
            MessageStore::subscribe(&self.storage, chat_id, self.config.message_page_size),
            me,
            names,
        ));
        self.open = Some(OpenChat {
            chat_id,
            watcher,
            feed,
        });
        println!("Opened chat with {name}");
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(open) = self.open.take() {
            open.feed.abort();
            open.watcher.stop().await;
            println!("Closed chat");
        }
    }
}

async fn print_feed(
    mut feed: BoxStream<'static, StoreResult<Vec<Message>>>,
    me: Uuid,
    names: HashMap<Uuid, String>,
) {
    let mut seen = HashSet::new();
    while let Some(snapshot) = feed.next().await {
        let messages = match snapshot {
            Ok(messages) => messages,
            Err(e) => {
                log::warn!("Message feed error: {e}");
                continue;
            }
        };
        for message in messages {
            if !seen.insert(message.id) {
                continue;
            }
            let who = if message.sender_id == me {
                "you".to_string()
            } else {
                names
                    .get(&message.sender_id)
                    .cloned()
                    .unwrap_or_else(|| message.sender_id.to_string())
            };
            let body = match (&message.content, message.attachments.first()) {
                (Some(content), _) => content.clone(),
                (None, Some(attachment)) => {
                    format!("{} {}", attachment.kind.preview_label(), attachment.url)
                }
                (None, None) => String::new(),
            };
            let ticks = if message.sender_id != me {
                ""
            } else if message.read_by.keys().any(|id| *id != me) {
                " ✓✓ read"
            } else if !message.delivered_to.is_empty() {
                " ✓✓"
            } else {
                " ✓"
            };
            println!(
                "[{}] {who}: {body}{ticks}",
                message.created_at.with_timezone(&Local).format("%H:%M")
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    env_logger::init();

    let config = Config::from_env()?;
    let mut app = App::new(config)?;

    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        std::io::Write::flush(&mut std::io::stdout())?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };
        let input = line.trim();

        if input.eq_ignore_ascii_case("exit") {
            break;
        }
        if input.is_empty() {
            continue;
        }

        if let Err(e) = app.handle(input).await {
            println!("Error: {e:#}");
        }
    }

    println!("Exiting client...");
    app.close().await;
    if app.session.current_user_id().is_some() {
        app.session.sign_out(&app.storage).await?;
    }
    Ok(())
}
