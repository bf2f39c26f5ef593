use remote::session::loopback::LoopbackConnector;
use remote::{ClientConfig, Error, Fleet, Host, HostClient, HostDescriptor, Response, Targets};
use std::sync::Arc;

struct Sinks {
    results: async_channel::Receiver<Response>,
    errors: async_channel::Receiver<Error>,
}

impl Sinks {
    fn drain(&self) -> (Vec<Response>, Vec<Error>) {
        let mut results = Vec::new();
        while let Ok(response) = self.results.try_recv() {
            results.push(response);
        }
        let mut errors = Vec::new();
        while let Ok(err) = self.errors.try_recv() {
            errors.push(err);
        }
        (results, errors)
    }
}

/// One loopback host per root directory, each with its own pair of sinks.
fn fleet_over(roots: &[&std::path::Path]) -> (Fleet, Vec<Sinks>) {
    let mut hosts = Vec::new();
    let mut sinks = Vec::new();
    for (index, root) in roots.iter().enumerate() {
        let (result_tx, result_rx) = async_channel::unbounded();
        let (error_tx, error_rx) = async_channel::unbounded();
        let client = HostClient::new(
            HostDescriptor::new(format!("host{index}")),
            Arc::new(LoopbackConnector::new(*root)),
            ClientConfig::default(),
        );
        hosts.push(Host::new(Arc::new(client), result_tx, error_tx));
        sinks.push(Sinks {
            results: result_rx,
            errors: error_rx,
        });
    }
    (Fleet::new(hosts), sinks)
}

#[tokio::test]
async fn one_failing_host_does_not_affect_the_others() -> anyhow::Result<()> {
    let roots = [tempfile::tempdir()?, tempfile::tempdir()?, tempfile::tempdir()?];
    tokio::fs::write(roots[0].path().join("marker"), "first").await?;
    tokio::fs::write(roots[2].path().join("marker"), "third").await?;
    let paths: Vec<&std::path::Path> = roots.iter().map(|root| root.path()).collect();
    let (fleet, sinks) = fleet_over(&paths);
    fleet.run(&Targets::All, "cat marker")?.join().await;
    let (first, first_errors) = sinks[0].drain();
    let (second, second_errors) = sinks[1].drain();
    let (third, third_errors) = sinks[2].drain();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].stdout, "first");
    assert_eq!(first[0].host, "host0");
    assert!(first_errors.is_empty());
    assert!(second.is_empty());
    assert_eq!(second_errors.len(), 1);
    assert!(second_errors[0].is_connection_error());
    assert_eq!(third.len(), 1);
    assert_eq!(third[0].stdout, "third");
    assert!(third_errors.is_empty());
    Ok(())
}

#[tokio::test]
async fn downloads_are_suffixed_with_the_host_index() -> anyhow::Result<()> {
    let roots = [tempfile::tempdir()?, tempfile::tempdir()?];
    for (index, root) in roots.iter().enumerate() {
        tokio::fs::write(root.path().join("app.log"), format!("log of {index}")).await?;
    }
    let paths: Vec<&std::path::Path> = roots.iter().map(|root| root.path()).collect();
    let (fleet, sinks) = fleet_over(&paths);
    let local = tempfile::tempdir()?;
    let base = local.path().join("app.log");
    fleet
        .download(&Targets::All, "app.log", &base)?
        .join()
        .await;
    for sink in &sinks {
        let (results, errors) = sink.drain();
        assert_eq!(results.len(), 1, "{errors:?}");
    }
    assert_eq!(
        tokio::fs::read_to_string(local.path().join("app.log0")).await?,
        "log of 0"
    );
    assert_eq!(
        tokio::fs::read_to_string(local.path().join("app.log1")).await?,
        "log of 1"
    );
    assert!(!base.exists());
    Ok(())
}

#[tokio::test]
async fn only_selected_hosts_are_targeted() -> anyhow::Result<()> {
    let roots = [tempfile::tempdir()?, tempfile::tempdir()?, tempfile::tempdir()?];
    let paths: Vec<&std::path::Path> = roots.iter().map(|root| root.path()).collect();
    let (fleet, sinks) = fleet_over(&paths);
    let dispatch = fleet.run(&Targets::Only(vec![2, 0, 2]), "echo hi")?;
    assert_eq!(dispatch.len(), 2);
    dispatch.join().await;
    assert_eq!(sinks[0].drain().0.len(), 1);
    assert!(sinks[1].drain().0.is_empty());
    assert_eq!(sinks[2].drain().0.len(), 1);
    Ok(())
}

#[tokio::test]
async fn invalid_index_starts_nothing() -> anyhow::Result<()> {
    let roots = [tempfile::tempdir()?, tempfile::tempdir()?];
    let paths: Vec<&std::path::Path> = roots.iter().map(|root| root.path()).collect();
    let (fleet, sinks) = fleet_over(&paths);
    let err = fleet.run(&Targets::Only(vec![0, 5]), "echo hi").unwrap_err();
    assert!(matches!(err, Error::InvalidTarget { index: 5, len: 2 }), "{err:?}");
    assert!(!err.is_connection_error());
    for sink in &sinks {
        let (results, errors) = sink.drain();
        assert!(results.is_empty());
        assert!(errors.is_empty());
    }
    Ok(())
}

#[tokio::test]
async fn hosts_may_share_sinks() -> anyhow::Result<()> {
    let roots = [tempfile::tempdir()?, tempfile::tempdir()?, tempfile::tempdir()?];
    let (result_tx, result_rx) = async_channel::unbounded();
    let (error_tx, error_rx) = async_channel::unbounded::<Error>();
    let hosts = roots
        .iter()
        .enumerate()
        .map(|(index, root)| {
            let client = HostClient::new(
                HostDescriptor::new(format!("host{index}")),
                Arc::new(LoopbackConnector::new(root.path())),
                ClientConfig::default(),
            );
            Host::new(Arc::new(client), result_tx.clone(), error_tx.clone())
        })
        .collect();
    let fleet = Fleet::new(hosts);
    let local = tempfile::tempdir()?;
    let file = local.path().join("payload");
    tokio::fs::write(&file, "same everywhere").await?;
    fleet.upload(&Targets::All, &file, "copied")?.join().await;
    let mut hosts_seen: Vec<String> = Vec::new();
    while let Ok(response) = result_rx.try_recv() {
        hosts_seen.push(response.host);
    }
    hosts_seen.sort();
    assert_eq!(hosts_seen, vec!["host0", "host1", "host2"]);
    assert!(error_rx.try_recv().is_err());
    for root in &roots {
        assert_eq!(
            tokio::fs::read_to_string(root.path().join("copied")).await?,
            "same everywhere"
        );
    }
    Ok(())
}

#[tokio::test]
async fn edit_is_applied_on_every_host() -> anyhow::Result<()> {
    let roots = [tempfile::tempdir()?, tempfile::tempdir()?, tempfile::tempdir()?];
    for root in &roots[..2] {
        tokio::fs::write(root.path().join("motd"), "welcome to OLD\n").await?;
    }
    let paths: Vec<&std::path::Path> = roots.iter().map(|root| root.path()).collect();
    let (fleet, sinks) = fleet_over(&paths);
    // relative paths resolve against each host's root
    fleet
        .run_on_file(
            &Targets::All,
            "motd",
            Arc::new(|content: String| content.replace("OLD", "NEW")),
        )?
        .join()
        .await;
    assert_eq!(sinks[0].drain().0.len(), 1);
    assert_eq!(sinks[1].drain().0.len(), 1);
    let (results, errors) = sinks[2].drain();
    assert!(results.is_empty());
    assert!(matches!(errors.as_slice(), [Error::Remote(_)]), "{errors:?}");
    for root in &roots[..2] {
        assert_eq!(
            tokio::fs::read_to_string(root.path().join("motd")).await?,
            "welcome to NEW\n"
        );
    }
    Ok(())
}
