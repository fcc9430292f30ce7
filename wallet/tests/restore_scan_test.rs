mod common;

use common::{test_address, TestEnvironment, GAP_LIMIT};
use onchain_core::{AddressType, Chain};
use wallet::wallet::RefreshOptions;
use wallet::WalletError;

/// Receive addresses of the test phrase at indices 0 and 4
const REFERENCE_ADDRESSES: [(AddressType, &str, &str); 3] = [
    (
        AddressType::P2pkh,
        "mkpZhYtJu2r87Js3pDiWJDmPte2NRZ8bJV",
        "n2BMo5arHDyAK2CM8c56eoEd18uEkKnRLC",
    ),
    (
        AddressType::P2sh,
        "2Mww8dCYPUpKHofjgcXcBCEGmniw9CoaiD2",
        "2MuKeQzUHhUQWUZgx5AuNWoQ7YWx6vsXxrv",
    ),
    (
        AddressType::P2wpkh,
        "bcrt1q6rz28mcfaxtmd6v789l9rrlrusdprr9pz3cppk",
        "bcrt1q677973lw0w796gttpy52f296jqaaksz0kadvlr",
    ),
];

#[tokio::test]
async fn test_restore_finds_funds_of_every_address_type() {
    let env = TestEnvironment::new();

    for (_, first, fifth) in REFERENCE_ADDRESSES {
        env.indexer.fund(first, 10_000, 150);
        env.indexer.fund(fifth, 20_000, 151);
    }

    env.restore("restored").await.unwrap();

    let state = env
        .manager
        .storage
        .load_network_state("restored", onchain_core::Network::Regtest)
        .unwrap();
    for (address_type, first, fifth) in REFERENCE_ADDRESSES {
        let cursors = state.book.cursors(address_type);
        assert_eq!(cursors.receive.last_used, Some(4), "{}", address_type);
        assert_eq!(cursors.change.last_used, None, "{}", address_type);

        let (_, entry) = state.book.lookup_address(first).unwrap();
        assert_eq!(entry.index, 0);
        let (_, entry) = state.book.lookup_address(fifth).unwrap();
        assert_eq!(entry.index, 4);

        // The window after the last used index was probed too
        let probed = state.book.entries(address_type, Chain::Receive).count() as u32;
        assert_eq!(probed, 5 + GAP_LIMIT);
    }

    let balance = env.manager.get_balance("restored").unwrap();
    assert_eq!(balance.confirmed_sats, 90_000);
    assert_eq!(balance.unconfirmed_sats, 0);
    assert_eq!(balance.utxo_count, 6);
    assert_eq!(balance.last_synced_height, Some(200));

    let history = env
        .manager
        .get_transactions("restored", &Default::default())
        .unwrap();
    assert_eq!(history.len(), 6);
    assert!(history.windows(2).all(|w| w[0].height >= w[1].height));
}

#[tokio::test]
async fn test_restore_of_unused_phrase_probes_one_window_per_chain() {
    let env = TestEnvironment::new();

    let info = env
        .manager
        .restore_wallet(wallet::api::types::RestoreWalletRequest {
            name: "empty".to_string(),
            mnemonic: common::TEST_MNEMONIC.to_string(),
            passphrase: None,
            networks: Vec::new(),
        })
        .await
        .unwrap();

    // 3 address types x 2 chains x gap limit
    assert_eq!(env.indexer.history_queries(), 30);
    assert_eq!(info.address_type, AddressType::P2wpkh);
    assert_eq!(info.first_address, REFERENCE_ADDRESSES[2].1);
    assert!(info.mnemonic.is_none());

    let balance = env.manager.get_balance("empty").unwrap();
    assert_eq!(balance.total_sats, 0);
    assert_eq!(env.manager.selected_wallet().unwrap(), "empty");
}

#[tokio::test]
async fn test_unanswered_address_keeps_scanning_past_it() {
    let env = TestEnvironment::new();
    let unanswered = test_address(AddressType::P2wpkh, Chain::Receive, 4);
    let beyond = test_address(AddressType::P2wpkh, Chain::Receive, 8);
    env.indexer.fund(&unanswered, 10_000, 150);
    env.indexer.fund(&beyond, 20_000, 151);
    env.indexer.set_malformed(&unanswered, true);

    env.restore("patchy").await.unwrap();

    // Index 8 lies past the first window and is only reached through index 4
    let balance = env.manager.get_balance("patchy").unwrap();
    assert_eq!(balance.total_sats, 20_000);
    let state = env
        .manager
        .storage
        .load_network_state("patchy", onchain_core::Network::Regtest)
        .unwrap();
    assert_eq!(
        state.book.cursors(AddressType::P2wpkh).receive.last_used,
        Some(8)
    );

    env.indexer.set_malformed(&unanswered, false);
    let summary = env
        .manager
        .refresh("patchy", RefreshOptions::default())
        .await
        .unwrap();
    assert_eq!(summary.balance.total(), 30_000);
    assert_eq!(env.manager.get_balance("patchy").unwrap().utxo_count, 2);
}

#[tokio::test]
async fn test_failed_restore_leaves_nothing_behind() {
    let env = TestEnvironment::new();
    env.indexer.set_unreachable(true);

    let result = env.restore("doomed").await;
    assert!(result.is_err());
    assert!(!env.manager.storage.wallet_exists("doomed"));
    assert!(env.manager.list_wallets().unwrap().is_empty());

    // A later attempt starts from scratch
    env.indexer.set_unreachable(false);
    env.restore("doomed").await.unwrap();
    assert_eq!(env.manager.list_wallets().unwrap().len(), 1);
}

#[tokio::test]
async fn test_name_is_held_while_restore_runs() {
    let env = TestEnvironment::new();
    env.indexer.pause();

    let (restored, _) = tokio::join!(env.restore("contested"), async {
        env.indexer.wait_paused().await;

        let created = env
            .manager
            .create_wallet(wallet::api::types::CreateWalletRequest {
                name: "contested".to_string(),
                word_count: None,
                address_count: Some(0),
                network: None,
            })
            .await;
        assert!(matches!(created, Err(WalletError::WalletExists(_))));

        let again = env.restore("contested").await.unwrap_err();
        let again = again.downcast::<WalletError>().unwrap();
        assert!(matches!(again, WalletError::WalletExists(_)));

        env.indexer.set_unreachable(true);
        env.indexer.release();
    });

    // The failed restore cleans up after itself and frees the name
    assert!(restored.is_err());
    assert!(!env.manager.storage.wallet_exists("contested"));
    assert!(env.manager.list_wallets().unwrap().is_empty());

    env.indexer.set_unreachable(false);
    env.restore("contested").await.unwrap();
    assert_eq!(env.manager.list_wallets().unwrap().len(), 1);
}

#[tokio::test]
async fn test_restore_rejects_existing_name_and_bad_phrase() {
    let env = TestEnvironment::new();
    env.restore("twice").await.unwrap();

    let err = env.restore("twice").await.unwrap_err();
    let err = err.downcast::<WalletError>().unwrap();
    assert!(matches!(err, WalletError::WalletExists(_)));

    let result = env
        .manager
        .restore_wallet(wallet::api::types::RestoreWalletRequest {
            name: "garbled".to_string(),
            mnemonic: "abandon abandon".to_string(),
            passphrase: None,
            networks: Vec::new(),
        })
        .await;
    assert!(matches!(result, Err(WalletError::Core(_))));
    assert!(!env.manager.storage.wallet_exists("garbled"));
}
