/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

pub(crate) mod mock_broker;
pub(crate) mod mock_services;
pub(crate) mod mock_transport;

/// PKCS#1 RSA key used to sign custom-authorizer tokens in tests
pub(crate) const TEST_SIGNING_KEY: &str = include_str!("../../testdata/token_signing_key.pem");

/// Base64 PKCS#1 v1.5 / SHA-256 signature of the token "allow" under `TEST_SIGNING_KEY`
pub(crate) const ALLOW_SIGNATURE: &str = "zeAHCJSeUnV88xyi3uukf8EnHIaT60ZEe72EjSfBXMGn0n9k5eK6JfNFO/wpkm2U6C39lnfHQCS7v4XgBTuC8NGBruoMjKgujCEE+kf5y7kn+D6io7coGFRLIofS4pYblF/0Hmb6aMtfI6+EKuXJ88GwJ2cVJMATMfYk4lVSnFAQGfILVuNulqUcmTwOmgOcv5QMTK+SRuHMjncyyLFlr8KLBvgFVv4H7sXO9k9OyWIpGW4tO+FV9sdLyzDEZDhilQSUY8358LGEmT+4oqx5ubEKsSiM0BWP2XcXODLus+J+JCllyMMgjSoMiyqL4OLh/hN7dOArnTwOH0L6j4Mp+Q==";
