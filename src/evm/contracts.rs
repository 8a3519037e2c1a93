//! Gateway contract ABI definitions
//!
//! Uses alloy's sol! macro to generate type-safe bindings for the home and
//! side gateways and the ERC20 tokens they move.

#![allow(clippy::too_many_arguments)]

use alloy::sol;

sol! {
    /// Home chain gateway: holds deposited funds and pays out signed claims
    #[sol(rpc)]
    contract HomeGateway {
        // ========================================================================
        // Deposits
        // ========================================================================

        function depositETH() external payable;

        /// Requires a prior ERC20 approval of at least `amount`
        function depositERC20(uint256 amount, address token) external;

        // ========================================================================
        // Claims
        // ========================================================================

        /// Claim a native withdrawal with the oracle's signature
        function withdrawETH(uint256 amount, bytes signature) external;

        function withdrawERC20(uint256 amount, bytes signature, address token) external;

        /// Claims paid out to `owner` so far
        function nonces(address owner) external view returns (uint256);

        // ========================================================================
        // Events
        // ========================================================================

        event ETHReceived(address indexed from, uint256 amount);

        event ERC20Received(address indexed from, uint256 amount, address indexed token);

        event TokenWithdrawn(address indexed owner, uint8 kind, address indexed token, uint256 amount);
    }

    /// Side chain gateway: takes exits and exposes the oracle-signed receipt
    #[sol(rpc)]
    contract SideGateway {
        function withdrawETH(uint256 amount) external payable;

        function withdrawERC20(uint256 amount, address token) external;

        /// The owner's latest receipt; `nonce` is zero when none was issued
        function unclaimedReceipt(address owner) external view returns (
            address receiptOwner,
            uint8 kind,
            address token,
            uint256 amount,
            uint256 nonce,
            bytes signature
        );

        event TokenWithdrawalSigned(
            address indexed owner,
            address indexed token,
            uint8 kind,
            uint256 amount,
            uint256 nonce,
            bytes signature
        );
    }

    /// Standard ERC20 interface
    #[sol(rpc)]
    contract ERC20 {
        function balanceOf(address account) external view returns (uint256);
        function transfer(address to, uint256 amount) external returns (bool);
        function allowance(address owner, address spender) external view returns (uint256);
        function approve(address spender, uint256 amount) external returns (bool);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::EventKind;
    use alloy::sol_types::SolEvent;

    #[test]
    fn test_event_signatures_match_decoder() {
        assert_eq!(
            HomeGateway::ETHReceived::SIGNATURE_HASH,
            EventKind::EthReceived.topic()
        );
        assert_eq!(
            HomeGateway::ERC20Received::SIGNATURE_HASH,
            EventKind::Erc20Received.topic()
        );
        assert_eq!(
            HomeGateway::TokenWithdrawn::SIGNATURE_HASH,
            EventKind::TokenWithdrawn.topic()
        );
        assert_eq!(
            SideGateway::TokenWithdrawalSigned::SIGNATURE_HASH,
            EventKind::WithdrawalSigned.topic()
        );
    }
}
