use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "nxs")]
#[command(about = "NXS Chat terminal client")]
pub struct Cli {
    /// Data directory (defaults to NXS_ROOT or the platform data dir)
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create an account
    Signup {
        #[arg(long)]
        full_name: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        username: String,
        /// YYYY-MM-DD
        #[arg(long)]
        date_of_birth: String,
        /// male, female or other
        #[arg(long)]
        gender: String,
        #[arg(long)]
        password: String,
    },
    /// Sign in with email and password
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    Logout,
    /// Show the signed-in user
    Whoami,
    /// Update your profile
    Profile(ProfileArgs),
    /// Upload a profile picture
    Avatar { file: PathBuf },
    /// List conversations
    Chats,
    /// Start (or reuse) a private chat with a user
    Start { username: String },
    /// Open a chat and follow it live; lines typed are sent
    Open { chat_id: String },
    /// Send one message
    Send {
        chat_id: String,
        text: String,
        #[arg(long)]
        reply_to: Option<String>,
    },
    Edit { message_id: String, text: String },
    Delete { message_id: String },
    /// Mark a chat as read
    Read { chat_id: String },
    /// Find users by username or name
    Search { query: String },
    Block { user_id: String },
    Unblock { user_id: String },
    #[command(subcommand)]
    Status(StatusCommand),
    /// Pair with a random user and chat until EOF
    Random {
        /// Seconds to wait for a partner
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },
    Admin(AdminArgs),
    /// Scripted two-user session on the in-memory backend
    Demo,
    /// Remember a data directory for later runs (NXS_ROOT still wins)
    SetRoot { path: PathBuf },
}

#[derive(Args)]
pub struct ProfileArgs {
    #[arg(long)]
    pub full_name: Option<String>,
    #[arg(long)]
    pub username: Option<String>,
    #[arg(long)]
    pub bio: Option<String>,
    /// true or false
    #[arg(long)]
    pub public: Option<bool>,
}

#[derive(Subcommand)]
pub enum StatusCommand {
    /// Post a status that lasts for the configured expiry
    Post {
        text: String,
        /// anyone or contacts
        #[arg(long, default_value = "anyone")]
        visibility: String,
    },
    /// List active statuses
    List,
    /// Show one status and record the view
    View { status_id: String },
    Delete { status_id: String },
}

#[derive(Args)]
pub struct AdminArgs {
    #[arg(long)]
    pub username: String,
    #[arg(long)]
    pub password: String,
    #[command(subcommand)]
    pub command: AdminCommand,
}

#[derive(Subcommand)]
pub enum AdminCommand {
    /// Check the credentials
    Login,
    Dashboard,
    /// List or search users
    Users {
        #[arg(long)]
        search: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Counts for one user
    User { user_id: String },
    Ban { user_id: String },
    Unban { user_id: String },
    DeleteUser { user_id: String },
    /// Newest messages or statuses
    Moderate {
        /// messages or statuses
        #[arg(default_value = "messages")]
        kind: String,
    },
    /// Remove a message or status
    Remove { kind: String, id: String },
    Analytics {
        /// 7d, 30d or all
        #[arg(default_value = "7d")]
        period: String,
    },
    /// Print system settings
    Settings,
    /// Change one system setting
    Set { key: String, value: String },
}
