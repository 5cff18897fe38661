//! Control channel commands understood by the server, plus the
//! `h1,h2,h3,h4,p1,p2` address encoding shared by `PORT` and `PASV`.

use std::net::{Ipv4Addr, SocketAddrV4};

/// A parsed client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    User(String),
    Pass(String),
    Auth(String),
    Pbsz(String),
    Prot(String),
    Type(String),
    Mode(String),
    Stru(String),
    Pasv,
    Port(SocketAddrV4),
    Stor(String),
    /// Append to (or create) a file; used to resume interrupted uploads.
    Appe(String),
    Dele(String),
    Rnfr(String),
    Rnto(String),
    Nlst(Option<String>),
    List(Option<String>),
    Mkd(String),
    Cwd(String),
    Cdup,
    Pwd,
    Size(String),
    Syst,
    Feat,
    Noop,
    Quit,
    /// Known verb with a missing or unparsable argument.
    Malformed(String),
    Unknown(String),
}

impl Command {
    /// Parses one control line (terminator already stripped).
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end();
        let (verb, arg) = match line.split_once(' ') {
            Some((v, a)) => (v, Some(a.trim_start()).filter(|a| !a.is_empty())),
            None => (line, None),
        };
        let verb = verb.to_ascii_uppercase();
        let required = |make: fn(String) -> Command| match arg {
            Some(a) => make(a.to_string()),
            None => Command::Malformed(verb.clone()),
        };

        match verb.as_str() {
            "USER" => required(Command::User),
            // An empty password is legal.
            "PASS" => Command::Pass(arg.unwrap_or("").to_string()),
            "AUTH" => required(Command::Auth),
            "PBSZ" => required(Command::Pbsz),
            "PROT" => required(Command::Prot),
            "TYPE" => required(Command::Type),
            "MODE" => required(Command::Mode),
            "STRU" => required(Command::Stru),
            "PASV" => Command::Pasv,
            "PORT" => match arg.and_then(parse_host_port) {
                Some(addr) => Command::Port(addr),
                None => Command::Malformed(verb.clone()),
            },
            "STOR" => required(Command::Stor),
            "APPE" => required(Command::Appe),
            "DELE" => required(Command::Dele),
            "RNFR" => required(Command::Rnfr),
            "RNTO" => required(Command::Rnto),
            "NLST" => Command::Nlst(arg.map(str::to_string)),
            "LIST" => Command::List(arg.filter(|a| !a.starts_with('-')).map(str::to_string)),
            "MKD" | "XMKD" => required(Command::Mkd),
            "CWD" | "XCWD" => required(Command::Cwd),
            "CDUP" | "XCUP" => Command::Cdup,
            "PWD" | "XPWD" => Command::Pwd,
            "SIZE" => required(Command::Size),
            "SYST" => Command::Syst,
            "FEAT" => Command::Feat,
            "NOOP" => Command::Noop,
            "QUIT" => Command::Quit,
            _ => Command::Unknown(verb.clone()),
        }
    }

    /// Commands accepted before login completes.
    pub fn allowed_before_login(&self) -> bool {
        matches!(
            self,
            Command::User(_)
                | Command::Pass(_)
                | Command::Auth(_)
                | Command::Pbsz(_)
                | Command::Prot(_)
                | Command::Feat
                | Command::Syst
                | Command::Noop
                | Command::Quit
                | Command::Malformed(_)
                | Command::Unknown(_)
        )
    }
}

/// Parses `h1,h2,h3,h4,p1,p2`.
pub fn parse_host_port(s: &str) -> Option<SocketAddrV4> {
    let nums: Vec<u8> = s
        .trim()
        .split(',')
        .map(|n| n.trim().parse::<u8>())
        .collect::<Result<_, _>>()
        .ok()?;
    let [a, b, c, d, p1, p2] = nums.as_slice() else {
        return None;
    };
    let port = (u16::from(*p1) << 8) | u16::from(*p2);
    Some(SocketAddrV4::new(Ipv4Addr::new(*a, *b, *c, *d), port))
}

/// Formats an address as `h1,h2,h3,h4,p1,p2`.
pub fn format_host_port(addr: SocketAddrV4) -> String {
    let [a, b, c, d] = addr.ip().octets();
    let port = addr.port();
    format!("{a},{b},{c},{d},{},{}", port >> 8, port & 0xff)
}

/// Extracts the address from a `227 Entering Passive Mode (...)` reply text.
pub fn parse_pasv_reply(text: &str) -> Option<SocketAddrV4> {
    let start = text.find('(')?;
    let end = text[start..].find(')')? + start;
    parse_host_port(&text[start + 1..end])
}
