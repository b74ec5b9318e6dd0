use crate::error;

pub type Result<T> = ::std::result::Result<T, error::Error>;

#[macro_export]
macro_rules! io_err {
    ($kind:ident, $msg:expr) => {
        ::std::io::Error::new(::std::io::ErrorKind::$kind, $msg)
    };
}

/// Split a dial string of the form `proto!address!port` (or `proto!path` for
/// unix sockets) into the protocol and the remainder.
pub fn parse_proto(arg: &str) -> Option<(&str, String)> {
    let mut split = arg.splitn(2, '!');
    let proto = split.next()?;
    let rest = split.next()?;

    match proto {
        "tcp" => {
            let mut split = rest.splitn(2, '!');
            let (addr, port) = (split.next()?, split.next()?);
            Some((proto, format!("{}:{}", addr, port)))
        }
        _ => Some((proto, rest.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_proto_tcp() {
        assert_eq!(
            parse_proto("tcp!127.0.0.1!564"),
            Some(("tcp", "127.0.0.1:564".to_owned()))
        );
    }

    #[test]
    fn parse_proto_unix() {
        assert_eq!(
            parse_proto("unix!/tmp/styx.sock"),
            Some(("unix", "/tmp/styx.sock".to_owned()))
        );
    }

    #[test]
    fn parse_proto_rejects_bare_address() {
        assert_eq!(parse_proto("127.0.0.1:564"), None);
    }
}
