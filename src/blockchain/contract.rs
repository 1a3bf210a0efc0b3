// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! ServerEncryptedERC20 contract interface.

use alloy::sol;

// Define the contract interface using alloy's sol! macro
sol! {
    #[sol(rpc)]
    interface IServerEncryptedERC20 {
        event DepositRequested(bytes32 indexed requestId, bytes packedData, bytes encryptedIndex);
        event WithdrawalRequested(bytes32 indexed requestId, address indexed user, uint256 amount, bytes signature, uint256 timestamp);
        event BalanceStored(bytes32 indexed requestId, address indexed user, bytes encryptedAmount, bytes encryptedSymmetricKeyUser, bytes encryptedSymmetricKeyServer);
        event UserAuthenticated(address indexed user, bytes encryptedIndex);

        function requestCompleted(bytes32 requestId) external view returns (bool);
        function getEncryptedBalance(bytes32 _userIndex) external view returns (bytes memory encryptedAmount, bytes memory encryptedSymmetricKeyUser, bytes memory encryptedSymmetricKeyServer, bool exists);
        function getUserIndexByAddress(address _userAddress) external view returns (bytes memory encryptedIndex);

        function storeDeposit(bytes32 _requestId, bytes32 _userIndex, bytes calldata _encryptedAmount, bytes calldata _encryptedSymmetricKeyUser, bytes calldata _encryptedSymmetricKeyServer) external;
        function processWithdrawal(bytes32 _requestId, bytes32 _userIndex, address _user, uint256 _amount, bytes calldata _encryptedAmount, bytes calldata _encryptedSymmetricKeyUser, bytes calldata _encryptedSymmetricKeyServer) external;
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::keccak256;
    use alloy::sol_types::SolEvent;

    use super::IServerEncryptedERC20::{DepositRequested, WithdrawalRequested};

    #[test]
    fn event_topics_match_signatures() {
        assert_eq!(
            DepositRequested::SIGNATURE_HASH,
            keccak256("DepositRequested(bytes32,bytes,bytes)")
        );
        assert_eq!(
            WithdrawalRequested::SIGNATURE_HASH,
            keccak256("WithdrawalRequested(bytes32,address,uint256,bytes,uint256)")
        );
    }
}
