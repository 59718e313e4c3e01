use super::*;

#[test]
fn classify_ssh_diagnostics() {
    let cases = [
        (
            "ssh: connect to host r1 port 22: Connection timed out",
            ConnectionError::Timeout { host: "r1".into() },
        ),
        (
            "ssh: connect to host r1 port 22: Connection refused",
            ConnectionError::Refused { host: "r1".into() },
        ),
        (
            "ssh: Could not resolve hostname r1: Name or service not known",
            ConnectionError::UnknownHost { host: "r1".into() },
        ),
        (
            "failed to lookup address information: Name or service not known",
            ConnectionError::UnknownHost { host: "r1".into() },
        ),
        (
            "netops@r1: Permission denied (publickey,password).\n",
            ConnectionError::Auth {
                host: "r1".into(),
                message: "netops@r1: Permission denied (publickey,password).".into(),
            },
        ),
        (
            "kex_exchange_identification: read: Connection reset by peer",
            ConnectionError::Transport {
                host: "r1".into(),
                message: "kex_exchange_identification: read: Connection reset by peer".into(),
            },
        ),
    ];

    for (message, expected) in cases {
        assert_eq!(expected, ConnectionError::classify("r1", message), "{message}");
    }
}

#[test]
fn host_is_reported_for_every_variant() {
    let errors = [
        ConnectionError::Timeout { host: "r1".into() },
        ConnectionError::Auth {
            host: "r1".into(),
            message: "denied".into(),
        },
        ConnectionError::Rejected {
            host: "r1".into(),
            message: "corrupt".into(),
        },
    ];
    for error in errors {
        assert_eq!("r1", error.host());
    }
}

#[test]
fn stages_read_naturally() {
    assert_eq!("commit check", Stage::CommitCheck.to_string());
    let error = TransactionError::Rpc {
        stage: Stage::Unlock,
        source: RpcError::Timeout(Duration::from_secs(30)),
    };
    assert_eq!("unlock failed: no reply within 30s", error.to_string());
    assert_eq!(Stage::Unlock, error.stage());
}
